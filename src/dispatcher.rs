//! Ordered handler dispatch: starts the typing keep-alive, walks the
//! registered (filter-chain, handler) pairs for the event's kind, and stops
//! at the first handler that claims the event.

use crate::prelude::*;

use crate::context::EventContext;
use crate::metrics::DISPATCH_OUTCOMES;
use crate::router::Filter;
use crate::tools::room_name;
use crate::typing::TypingKeepAlive;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

/// A handler registered against one or more event kinds.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Human-readable name, used in logs and metrics labels.
    fn name(&self) -> &str;

    /// Attempts to handle `ctx`. Implementations that do not want this
    /// particular event should return `Ok(())` without calling
    /// [`EventContext::claim`].
    ///
    /// # Errors
    /// Any error is logged and recorded in metrics; it does not stop the
    /// dispatcher from trying subsequent handlers.
    async fn handle(&self, ctx: Arc<EventContext>) -> anyhow::Result<()>;
}

/// A registered handler: which event kinds it applies to, its own filter
/// chain (evaluated after the router's transport filters), and the handler
/// itself.
pub struct HandlerEntry {
    /// Event kinds this handler wants to see.
    pub kinds: Vec<EventKind>,
    /// Per-handler filters, evaluated in order; any `false` skips this
    /// handler for this event (not the whole dispatch).
    pub filters: Vec<Filter>,
    /// The handler.
    pub handler: Arc<dyn Handler>,
}

/// Walks the registered handler list for each dispatched event.
pub struct Dispatcher {
    handlers: Vec<HandlerEntry>,
    typing: Arc<TypingKeepAlive>,
    typing_timeout: Duration,
}

impl Dispatcher {
    /// Builds a dispatcher over `handlers`, using `typing_timeout` as the
    /// keep-alive re-assertion interval.
    #[must_use]
    pub fn new(handlers: Vec<HandlerEntry>, typing: Arc<TypingKeepAlive>, typing_timeout: Duration) -> Self {
        Self {
            handlers,
            typing,
            typing_timeout,
        }
    }

    /// Dispatches `ctx` to every matching handler in registration order
    /// until one claims it, then stops. Handler panics are caught at this
    /// boundary as a last-resort guard - this is not a substitute for
    /// handlers returning `Result`.
    pub async fn dispatch(&self, ctx: Arc<EventContext>) {
        let room_label = ctx.room.as_ref().map(room_name).unwrap_or_else(|| "none".to_string());

        let typing_guard = if ctx.event.kind == EventKind::RoomMessage {
            ctx.room
                .clone()
                .map(|room| self.typing.start(room, self.typing_timeout))
        } else {
            None
        };

        for entry in &self.handlers {
            if ctx.is_handled() {
                break;
            }
            if !entry.kinds.contains(&ctx.event.kind) {
                continue;
            }
            if !entry.filters.iter().all(|f| f(&ctx.event)) {
                continue;
            }

            trace!(handler = entry.handler.name(), "invoking handler");

            let handler = Arc::clone(&entry.handler);
            let ctx_for_handler = Arc::clone(&ctx);
            let result = AssertUnwindSafe(handler.handle(ctx_for_handler))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(handler = entry.handler.name(), "handler error: {e}"),
                Err(_) => {
                    error!(handler = entry.handler.name(), "handler panicked");
                    DISPATCH_OUTCOMES.with_label_values(&[&room_label, "panicked"]).inc();
                }
            }
        }

        if let Some(guard) = typing_guard {
            guard.stop().await;
        }

        let result = if ctx.is_handled() { "claimed" } else { "unclaimed" };
        DISPATCH_OUTCOMES.with_label_values(&[&room_label, result]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContent;
    use crate::context::EventMetadata;
    use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        claims: bool,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, ctx: Arc<EventContext>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.claims {
                ctx.claim();
            }
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl Handler for PanickingHandler {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(&self, _ctx: Arc<EventContext>) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    fn dummy_event() -> Event {
        Event {
            event_id: OwnedEventId::try_from("$e:example.org").unwrap(),
            room_id: None,
            sender: UserId::parse("@a:example.org").unwrap().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            kind: EventKind::RoomMessage,
            content: EventContent::default(),
        }
    }

    #[tokio::test]
    async fn second_handler_is_skipped_once_first_claims() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));

        let handlers = vec![
            HandlerEntry {
                kinds: vec![EventKind::RoomMessage],
                filters: vec![],
                handler: Arc::new(CountingHandler {
                    calls: Arc::clone(&calls_a),
                    claims: true,
                }),
            },
            HandlerEntry {
                kinds: vec![EventKind::RoomMessage],
                filters: vec![],
                handler: Arc::new(CountingHandler {
                    calls: Arc::clone(&calls_b),
                    claims: true,
                }),
            },
        ];

        let dispatcher = Dispatcher::new(handlers, Arc::new(TypingKeepAlive::new()), Duration::from_secs(30));
        let ctx = Arc::new(EventContext::new(dummy_event(), None, EventMetadata::default()));
        dispatcher.dispatch(ctx).await;

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_stop_the_dispatcher() {
        let calls_b = Arc::new(AtomicUsize::new(0));

        let handlers = vec![
            HandlerEntry {
                kinds: vec![EventKind::RoomMessage],
                filters: vec![],
                handler: Arc::new(PanickingHandler),
            },
            HandlerEntry {
                kinds: vec![EventKind::RoomMessage],
                filters: vec![],
                handler: Arc::new(CountingHandler {
                    calls: Arc::clone(&calls_b),
                    claims: false,
                }),
            },
        ];

        let dispatcher = Dispatcher::new(handlers, Arc::new(TypingKeepAlive::new()), Duration::from_secs(30));
        let ctx = Arc::new(EventContext::new(dummy_event(), None, EventMetadata::default()));
        dispatcher.dispatch(ctx).await;

        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    }
}
