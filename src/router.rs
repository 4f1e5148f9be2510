//! Event router: classifies each event, decrypts it if needed, applies
//! transport filters, and builds the execution context the dispatcher walks.
//!
//! Routing rules, in order (§4.5):
//! 1. To-device events (or events without a room) go straight to the crypto
//!    engine's to-device handler and never reach the dispatcher.
//! 2. Encrypted room events are decrypted before anything else sees them.
//! 3. Transport filters run as pure predicates; the first `false` drops the
//!    event silently.
//! 4. A context is built carrying the (possibly decrypted) event, thread
//!    metadata, and a fresh handled-flag.

use crate::prelude::*;

use crate::context::{EventContext, EventMetadata, ThreadEvent, ThreadView};
use crate::crypto::{CryptoEngine, CryptoError};

use std::sync::Arc;

use matrix_sdk::room::MessagesOptions;
use matrix_sdk::ruma::events::room::message::Relation as RumaRelation;
use matrix_sdk::ruma::events::{AnySyncMessageLikeEvent, AnySyncTimelineEvent, SyncMessageLikeEvent};

/// A pure predicate over an event. Returning `false` ends processing for
/// that event silently.
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Outcome of routing an event.
pub enum RouteOutcome {
    /// The event was dropped by routing (to-device, filtered, or a
    /// recoverable crypto failure that will be retried later).
    Dropped,
    /// The event survived routing and is ready for dispatch.
    Context(Arc<EventContext>),
}

/// Routes raw events into dispatch-ready contexts.
pub struct EventRouter {
    crypto: Arc<dyn CryptoEngine>,
    filters: Vec<Filter>,
    staleness_filter: Option<Filter>,
    /// Cap on thread-view depth when thread reconstruction is enabled;
    /// `None` means thread views are never built (`Credentials.is_thread_enabled == false`).
    thread_limit: Option<u32>,
}

impl EventRouter {
    /// Builds a router backed by `crypto`, applying `filters` in order and,
    /// for live events only, `staleness_filter` (typically [`not_stale`]).
    /// Historical events routed via [`Self::route_historical`] skip the
    /// staleness filter, since being old is the entire point of a backfilled
    /// event. `thread_limit` mirrors `Credentials.{is_thread_enabled,
    /// thread_limit}`: `Some(n)` builds a thread view up to depth `n` for any
    /// event that belongs to a thread; `None` disables thread reconstruction.
    #[must_use]
    pub fn new(
        crypto: Arc<dyn CryptoEngine>,
        filters: Vec<Filter>,
        staleness_filter: Option<Filter>,
        thread_limit: Option<u32>,
    ) -> Self {
        Self {
            crypto,
            filters,
            staleness_filter,
            thread_limit,
        }
    }

    /// Routes a room-scoped event (message, encrypted, or member state) from
    /// live `/sync`, applying the staleness filter.
    pub async fn route(&self, event: Event, room: Room) -> RouteOutcome {
        self.route_inner(event, room, true).await
    }

    /// Routes a room-scoped event surfaced by the backfill engine, skipping
    /// the staleness filter.
    pub async fn route_historical(&self, event: Event, room: Room) -> RouteOutcome {
        self.route_inner(event, room, false).await
    }

    async fn route_inner(&self, event: Event, room: Room, apply_staleness: bool) -> RouteOutcome {
        if event.kind.is_to_device() {
            // Room-scoped to-device events don't exist in practice; this
            // branch exists for symmetry with `route_to_device` and is only
            // reachable if a caller mis-files an event.
            return RouteOutcome::Dropped;
        }

        let event = if self.crypto.is_encrypted(&event) {
            match self.crypto.decrypt_event(&room, &event).await {
                Ok(plain) => plain,
                Err(CryptoError::NoSession) => {
                    warn!(event_id = %event.event_id, "no session to decrypt, key request emitted");
                    // the event stays inflight; caller's worker loop will
                    // unmark it and a later sync/backfill pass retries once
                    // the forwarded key arrives.
                    return RouteOutcome::Dropped;
                }
                Err(CryptoError::Other(e)) => {
                    error!("decrypt failed: {e}");
                    return RouteOutcome::Dropped;
                }
            }
        } else {
            event
        };

        for filter in &self.filters {
            if !filter(&event) {
                trace!(event_id = %event.event_id, "dropped by transport filter");
                return RouteOutcome::Dropped;
            }
        }

        if apply_staleness {
            if let Some(filter) = &self.staleness_filter {
                if !filter(&event) {
                    trace!(event_id = %event.event_id, "dropped as stale");
                    return RouteOutcome::Dropped;
                }
            }
        }

        let metadata = EventMetadata {
            thread_id: event.content.relation.as_ref().and_then(|r| r.thread_root.clone()),
            in_reply_to: event.content.relation.as_ref().and_then(|r| r.in_reply_to.clone()),
        };

        let thread = match (self.thread_limit, &metadata.thread_id) {
            (Some(limit), Some(thread_id)) => self.build_thread_view(&room, thread_id, limit).await,
            _ => None,
        };

        let mut ctx = EventContext::new(event, Some(room), metadata);
        if let Some(thread) = thread {
            ctx.set_thread(thread);
        }

        RouteOutcome::Context(Arc::new(ctx))
    }

    /// Routes a to-device event straight to the crypto engine; never
    /// produces a context.
    pub async fn route_to_device(&self, event: crate::crypto::ToDeviceEvent) {
        self.crypto.handle_to_device(event).await;
    }

    /// Walks `/messages` backward from the room's current end, collecting
    /// every message belonging to `thread_id` up to `limit` events, and
    /// reverses the result to chronological order.
    async fn build_thread_view(&self, room: &Room, thread_id: &OwnedEventId, limit: u32) -> Option<ThreadView> {
        let mut page_options = MessagesOptions::backward();
        page_options.limit = limit.into();

        let response = room.messages(page_options).await.ok()?;

        let mut events = Vec::new();
        for timeline_event in response.chunk {
            let Ok(any_event) = timeline_event.raw().deserialize() else {
                continue;
            };
            let AnySyncTimelineEvent::MessageLike(AnySyncMessageLikeEvent::RoomMessage(
                SyncMessageLikeEvent::Original(ev),
            )) = any_event
            else {
                continue;
            };

            let belongs_to_thread = match &ev.content.relates_to {
                Some(RumaRelation::Thread(thread)) => thread.event_id == *thread_id,
                _ => ev.event_id == *thread_id,
            };
            if !belongs_to_thread {
                continue;
            }

            events.push(ThreadEvent {
                event_id: ev.event_id.clone(),
                sender: ev.sender.clone(),
                body: ev.content.body().to_owned(),
            });

            if events.len() as u32 >= limit {
                break;
            }
        }

        // Server returns newest-first; reverse to chronological order.
        events.reverse();

        Some(ThreadView {
            room_id: room.room_id().to_owned(),
            root: thread_id.clone(),
            events,
        })
    }
}

/// Standard transport filter: drop events sent by the bot itself.
#[must_use]
pub fn not_self(bot_user_id: OwnedUserId) -> Filter {
    Arc::new(move |event: &Event| event.sender != bot_user_id)
}

/// Standard transport filter: drop events older than `max_age`.
#[must_use]
pub fn not_stale(max_age: Duration) -> Filter {
    Arc::new(move |event: &Event| {
        let Some(ts) = event.origin_server_ts.to_system_time() else {
            return false;
        };
        ts + max_age >= SystemTime::now()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContent;
    use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;

    fn event_from(sender: &str) -> Event {
        Event {
            event_id: OwnedEventId::try_from("$e:example.org").unwrap(),
            room_id: None,
            sender: UserId::parse(sender).unwrap().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            kind: EventKind::RoomMessage,
            content: EventContent::default(),
        }
    }

    #[test]
    fn not_self_rejects_own_events() {
        let bot: OwnedUserId = UserId::parse("@bot:example.org").unwrap().to_owned();
        let filter = not_self(bot.clone());

        assert!(!filter(&event_from("@bot:example.org")));
        assert!(filter(&event_from("@someone:example.org")));
    }
}
