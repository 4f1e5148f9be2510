//! Default binary: wires the sync driver, backfill engine, contract
//! dispatch, health observer, and metrics server around an empty service
//! registry. Embedding bots that want concrete services (a generative-text
//! backend behind `AutoParser`, a media-consuming service behind
//! `MediaParser`, ...) are expected to build their own binary against the
//! library directly rather than extend this one.

use mxframe::backfill::Backfill;
use mxframe::config::Config;
use mxframe::contracts::{ContractDispatchHandler, ParserChain, ServiceRegistry, StructuredTagParser, TextDirectiveParser};
use mxframe::crypto::MatrixCryptoEngine;
use mxframe::db::DBPools;
use mxframe::dedup::{Dedup, InMemoryDedup, PostgresDedup};
use mxframe::dispatcher::{Dispatcher, HandlerEntry};
use mxframe::event::EventKind;
use mxframe::health::HealthObserver;
use mxframe::joinstore::JoinStore;
use mxframe::metrics::{serve_metrics, track_metrics};
use mxframe::router::{not_self, not_stale, EventRouter};
use mxframe::session;
use mxframe::sync::SyncDriver;
use mxframe::typing::TypingKeepAlive;

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;

/// How stale a live event can be before the transport filter drops it.
const MAX_EVENT_AGE: Duration = Duration::from_secs(600);

/// How often the in-memory dedup sweeper runs, when durable dedup isn't configured.
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config_path: String = std::env::args().nth(1).expect("no config path provided");
    let config = Config::new(config_path)?;

    DBPools::init(&config)?;

    let client = session::build_client(&config).await?;
    let bot_user_id = client.user_id().expect("login completed").to_owned();

    let crypto = Arc::new(MatrixCryptoEngine::new(client.clone()));
    let filters = vec![not_self(bot_user_id.clone())];
    let staleness_filter = not_stale(MAX_EVENT_AGE);
    let creds = config.credentials();
    let thread_limit = creds.is_thread_enabled.then_some(creds.thread_limit);
    let router = Arc::new(EventRouter::new(crypto, filters, Some(staleness_filter), thread_limit));

    let registry = Arc::new(ServiceRegistry::new());

    let mut parsers = ParserChain::new();
    parsers.push(Arc::new(StructuredTagParser));
    parsers.push(Arc::new(TextDirectiveParser::new(bot_user_id.localpart(), true)));

    let contract_handler = HandlerEntry {
        kinds: vec![EventKind::RoomMessage],
        filters: vec![],
        handler: Arc::new(ContractDispatchHandler::new(parsers, Arc::clone(&registry))),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        vec![contract_handler],
        Arc::new(TypingKeepAlive::new()),
        config.typing_timeout(),
    ));

    let dedup: Arc<dyn Dedup> = match config.dedup_postgres_pool() {
        Some(pool) => Arc::new(PostgresDedup::new(pool)),
        None => {
            let dedup = Arc::new(InMemoryDedup::new());
            dedup.spawn_sweeper(DEDUP_SWEEP_INTERVAL);
            dedup
        }
    };

    let data_dir = std::path::Path::new(&config.data_dir()).to_path_buf();
    let join_store = Arc::new(JoinStore::load(&session::join_cursor_path(
        &data_dir,
        bot_user_id.localpart(),
    )));

    let sync_driver = Arc::new(SyncDriver::new(
        client,
        Arc::clone(&router),
        Arc::clone(&dispatcher),
        Arc::clone(&dedup),
        Arc::clone(&join_store),
        config.clone(),
    )?);

    let sync_handle = sync_driver.start_listening().await?;

    if config.enable_backfill() {
        let backfill = Arc::new(Backfill::new(
            sync_driver.client().clone(),
            Arc::clone(&router),
            Arc::clone(&dispatcher),
            Arc::clone(&dedup),
            Arc::clone(&join_store),
            bot_user_id.clone(),
            config.backfill_limit_per_request(),
        ));
        backfill.spawn_for_known_rooms(config.patch_start_millis());
    }

    if let Some(interval) = config.healthcheck_interval() {
        let observer = HealthObserver::new(interval, config.with_auto_switch(), Arc::clone(&registry));
        tokio::spawn(async move {
            let mut sub = observer.subscribe();
            loop {
                let snapshot = sub.next().await;
                tracing::debug!(?snapshot, "health snapshot");
            }
        });
    }

    if let Some(addr) = config.metrics_listen_addr() {
        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(serve_metrics))
                .route_layer(middleware::from_fn(track_metrics));
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("metrics server failed to bind {addr}: {e}");
                    return;
                }
            };
            tracing::info!("metrics server listening on {addr}");
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!("metrics server stopped: {e}");
            }
        });
    }

    sync_handle.await?;

    Ok(())
}
