//! Sync driver (§4.1): drives `/sync`, deduplicates and enqueues events for
//! workers, and persists the sync/join cursors.
//!
//! Modeled as two unidirectional interfaces per the cyclic-reference note in
//! §9: [`EventSink`] is the narrow surface the sync loop and backfill engine
//! push events through, and [`BotActions`] is what handlers call back into
//! the bot through. [`SyncDriver`] implements `EventSink`; both traits exist
//! so neither direction needs to hold an `Arc` back to the other's full
//! concrete type, avoiding the reference cycle the teacher's `module.rs`
//! solves with `WeakModuleInfo`.

use crate::prelude::*;

use crate::config::{AuthMode, ConfigError};
use crate::context::EventContext;
use crate::crypto::ToDeviceEvent;
use crate::dedup::{Dedup, DedupKey};
use crate::dispatcher::Dispatcher;
use crate::joinstore::JoinStore;
use crate::metrics::DEDUP_OUTCOMES;
use crate::router::{EventRouter, RouteOutcome};
use crate::session::{self, SyncCursor};

use matrix_sdk::crypto::types::events::forwarded_room_key::ForwardedRoomKeyToDeviceEvent;
use matrix_sdk::crypto::types::events::room_key::RoomKeyToDeviceEvent;
use matrix_sdk::crypto::types::events::room_key_request::RoomKeyRequestToDeviceEvent;
use matrix_sdk::ruma::events::room::member::{MembershipState, SyncRoomMemberEvent};
use matrix_sdk::ruma::events::room::message::OriginalSyncRoomMessageEvent;
use matrix_sdk::ruma::events::room::encrypted::OriginalSyncRoomEncryptedEvent;
use matrix_sdk::{LoopCtrl, Error as MatrixError};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Narrow surface the sync loop and backfill engine use to hand an event
/// off to deduplication and the worker queue. Kept separate from the full
/// `SyncDriver` so the event-handler closures registered with `Client`
/// don't need to name it.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Attempts to enqueue `event`/`room` for dispatch, subject to dedup.
    async fn offer(&self, event: Event, room: Room);
}

/// What handlers can call back into the bot for. A placeholder boundary
/// today (message sending already goes through `matrix_sdk::Room`
/// directly), named so that future handler-initiated actions (e.g.
/// triggering a reload) have a narrow trait to land on instead of handlers
/// reaching for a concrete `SyncDriver`/`Client`.
pub trait BotActions: Send + Sync {
    /// The bot's own user id.
    fn bot_user_id(&self) -> &OwnedUserId;
}

struct WorkItem {
    event: Event,
    room: Room,
    key: DedupKey,
}

/// Owns the Matrix client, the bounded worker queue, and the sync loop.
pub struct SyncDriver {
    client: Client,
    router: Arc<EventRouter>,
    dispatcher: Arc<Dispatcher>,
    dedup: Arc<dyn Dedup>,
    join_store: Arc<JoinStore>,
    config: Config,
    bot_user_id: OwnedUserId,
    data_dir: std::path::PathBuf,
    tx: mpsc::Sender<WorkItem>,
    rx: Mutex<Option<mpsc::Receiver<WorkItem>>>,
}

impl SyncDriver {
    /// Builds a driver around an already-authenticated `client`.
    #[must_use]
    pub fn new(
        client: Client,
        router: Arc<EventRouter>,
        dispatcher: Arc<Dispatcher>,
        dedup: Arc<dyn Dedup>,
        join_store: Arc<JoinStore>,
        config: Config,
    ) -> anyhow::Result<Self> {
        let bot_user_id = client
            .user_id()
            .ok_or_else(|| anyhow!("client has no user id; login did not complete"))?
            .to_owned();
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let data_dir = Path::new(&config.data_dir()).to_path_buf();

        Ok(Self {
            client,
            router,
            dispatcher,
            dedup,
            join_store,
            config,
            bot_user_id,
            data_dir,
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    fn sync_cursor_path(&self) -> std::path::PathBuf {
        session::sync_cursor_path(&self.data_dir, self.bot_user_id.localpart())
    }

    fn join_cursor_path(&self) -> std::path::PathBuf {
        session::join_cursor_path(&self.data_dir, self.bot_user_id.localpart())
    }

    /// Starts the worker pool and the `/sync` loop. Returns a join handle
    /// for the sync loop task; workers run detached and are torn down when
    /// the driver (and its queue sender) is dropped.
    ///
    /// # Errors
    /// Returns an error if the very first `/sync` call fails.
    pub async fn start_listening(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("start_listening called more than once"))?;
        self.spawn_workers(rx);

        // `m.room_key`/`m.room_key_request`/`m.forwarded_room_key` are
        // applied to the crypto store by matrix-sdk's own `OlmMachine`
        // before these handlers ever see them; routing them through the
        // router here is purely for observability (see crypto.rs).
        self.client.add_event_handler({
            let router = Arc::clone(&self.router);
            move |ev: RoomKeyToDeviceEvent| {
                let router = Arc::clone(&router);
                async move { router.route_to_device(ToDeviceEvent::RoomKey(ev)).await }
            }
        });
        self.client.add_event_handler({
            let router = Arc::clone(&self.router);
            move |ev: RoomKeyRequestToDeviceEvent| {
                let router = Arc::clone(&router);
                async move { router.route_to_device(ToDeviceEvent::RoomKeyRequest(ev)).await }
            }
        });
        self.client.add_event_handler({
            let router = Arc::clone(&self.router);
            move |ev: ForwardedRoomKeyToDeviceEvent| {
                let router = Arc::clone(&router);
                async move { router.route_to_device(ToDeviceEvent::ForwardedRoomKey(ev)).await }
            }
        });
        self.client.add_event_handler({
            let sink: Arc<dyn EventSink> = self.clone();
            move |ev: OriginalSyncRoomMessageEvent, room: Room| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Ok(event) = Event::try_from((ev, room.room_id().to_owned())) {
                        sink.offer(event, room).await;
                    }
                }
            }
        });
        self.client.add_event_handler({
            let sink: Arc<dyn EventSink> = self.clone();
            move |ev: OriginalSyncRoomEncryptedEvent, room: Room| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Ok(event) = Event::try_from((ev, room.room_id().to_owned())) {
                        sink.offer(event, room).await;
                    }
                }
            }
        });
        self.client.add_event_handler({
            let this = Arc::clone(self);
            move |ev: SyncRoomMemberEvent, room: Room| {
                let this = Arc::clone(&this);
                async move {
                    if ev.sender() == this.bot_user_id && matches!(ev.membership(), MembershipState::Join) {
                        this.join_store
                            .set_join_if_later(room.room_id().to_owned(), ev.origin_server_ts());
                    }
                    if let Ok(event) = Event::try_from((ev, room.room_id().to_owned())) {
                        let sink: Arc<dyn EventSink> = this.clone();
                        sink.offer(event, room).await;
                    }
                }
            }
        });

        let cursor = SyncCursor::load(&self.sync_cursor_path());
        let sync_settings = session::initial_sync_settings(&cursor);

        debug!("performing initial sync");
        let initial_response = self.client.sync_once(sync_settings.clone()).await?;
        self.record_prev_batches(&initial_response);

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            this.run_sync_loop(sync_settings).await;
        }))
    }

    async fn run_sync_loop(self: Arc<Self>, sync_settings: matrix_sdk::config::SyncSettings) {
        let retry = self.config.sync_retry();
        loop {
            let this = Arc::clone(&self);
            let result = self
                .client
                .sync_with_result_callback(sync_settings.clone(), |sync_result| {
                    let this = Arc::clone(&this);
                    async move {
                        match sync_result {
                            Ok(response) => {
                                this.record_prev_batches(&response);
                                if let Err(e) = this.persist_cursor(&response.next_batch) {
                                    error!("failed to persist sync cursor: {e}");
                                }
                                Ok(LoopCtrl::Continue)
                            }
                            Err(e) => {
                                if is_auth_error(&e) {
                                    warn!("sync rejected as unauthenticated, stopping loop for reauth");
                                    Ok(LoopCtrl::Break)
                                } else {
                                    error!("sync failed: {e}");
                                    Err(MatrixError::UnknownError(anyhow!(e.to_string()).into()))
                                }
                            }
                        }
                    }
                })
                .await;

            match result {
                Ok(()) => {
                    info!("reauthenticating after unauthenticated sync response");
                    if let Err(e) = self.reauth().await {
                        error!("reauth failed: {e}, retrying in {retry:?}");
                        tokio::time::sleep(retry).await;
                    }
                }
                Err(e) => {
                    warn!("sync loop exited: {e}, retrying in {retry:?}");
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }

    /// Re-runs the interactive login on the existing client to obtain a
    /// fresh access token after a 401, reusing the same device id and
    /// crypto store so reauth doesn't start a new Olm device.
    async fn reauth(&self) -> anyhow::Result<()> {
        let creds = self.config.credentials();
        let AuthMode::Interactive = creds.auth_mode else {
            return Err(ConfigError::AuthModeUnsupported(format!("{:?}", creds.auth_mode)).into());
        };

        let existing_device_id = self.client.device_id().map(ToOwned::to_owned);
        let auth = self.client.matrix_auth();
        let mut login = auth
            .login_username(&creds.username, &creds.password)
            .initial_device_display_name(&self.config.device_id());
        if let Some(device_id) = existing_device_id.as_deref() {
            login = login.device_id(device_id.as_str());
        }
        login.await?;
        info!("reauthenticated, resuming sync");
        Ok(())
    }

    /// Records each room's pagination token from a sync response. The
    /// server hands back the correct backward-pagination token for the page
    /// it just sent, so later responses simply overwrite earlier ones - see
    /// [`JoinStore::set_prev_batch`].
    fn record_prev_batches(&self, response: &matrix_sdk::sync::SyncResponse) {
        for (room_id, update) in &response.rooms.joined {
            if let Some(prev_batch) = &update.timeline.prev_batch {
                self.join_store.set_prev_batch(room_id.clone(), prev_batch.clone());
            }
        }
    }

    fn persist_cursor(&self, next_batch: &str) -> anyhow::Result<()> {
        let cursor = SyncCursor {
            next_batch: Some(next_batch.to_owned()),
            filter_id: None,
        };
        cursor.persist(&self.sync_cursor_path())?;
        self.join_store.persist(&self.join_cursor_path())
    }

    fn spawn_workers(self: &Arc<Self>, rx: mpsc::Receiver<WorkItem>) {
        let num_workers = self.config.num_workers();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..num_workers {
            let this = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else {
                        debug!(worker_id, "worker queue closed, exiting");
                        break;
                    };
                    this.process(item).await;
                }
            });
        }
    }

    async fn process(&self, item: WorkItem) {
        match self.router.route(item.event, item.room).await {
            RouteOutcome::Dropped => {
                if let Err(e) = self.dedup.unmark_inflight(&item.key).await {
                    error!("unmark_inflight failed: {e}");
                }
            }
            RouteOutcome::Context(ctx) => {
                self.dispatch_and_mark(ctx, item.key).await;
            }
        }
    }

    async fn dispatch_and_mark(&self, ctx: Arc<EventContext>, key: DedupKey) {
        self.dispatcher.dispatch(ctx).await;
        if let Err(e) = self.dedup.mark_processed(&key).await {
            error!("mark_processed failed: {e}");
        }
    }

    /// The bot's user id.
    #[must_use]
    pub fn bot_user_id(&self) -> &OwnedUserId {
        &self.bot_user_id
    }

    /// The underlying client, for the backfill engine and health pingers.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl EventSink for SyncDriver {
    async fn offer(&self, event: Event, room: Room) {
        let key = DedupKey::new(self.bot_user_id.clone(), event.event_id.clone());

        if let Some(floor) = self.config.patch_start_millis() {
            if event.timestamp_millis() < floor {
                trace!(event_id = %event.event_id, "below patchStart floor, dropping");
                return;
            }
        }

        match self.dedup.try_start_processing(&key, self.config.inflight_ttl()).await {
            Ok(true) => DEDUP_OUTCOMES.with_label_values(&["claimed"]).inc(),
            Ok(false) => {
                DEDUP_OUTCOMES.with_label_values(&["skipped"]).inc();
                return;
            }
            Err(e) => {
                DEDUP_OUTCOMES.with_label_values(&["error"]).inc();
                error!("dedup claim failed: {e}");
                return;
            }
        }

        match self.tx.try_send(WorkItem { event, room, key: key.clone() }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.config.worker_queue_full_log() {
                    warn!("worker queue full, dropping event and releasing lease");
                }
                if let Err(e) = self.dedup.unmark_inflight(&key).await {
                    error!("unmark_inflight after full queue failed: {e}");
                }
            }
            Err(TrySendError::Closed(_)) => {
                error!("worker queue closed, dropping event");
            }
        }
    }
}

impl BotActions for SyncDriver {
    fn bot_user_id(&self) -> &OwnedUserId {
        &self.bot_user_id
    }
}

fn is_auth_error(e: &matrix_sdk::Error) -> bool {
    let msg = e.to_string();
    msg.contains("401") || msg.to_uppercase().contains("M_UNKNOWN_TOKEN")
}
