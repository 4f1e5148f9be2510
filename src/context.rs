//! Execution context built around each [`crate::event::Event`] as it passes
//! through the dispatcher.
//!
//! The Go source models "has a handler already claimed this event" with a
//! read-write-mutex unlocker: `IsHandledWithUnlocker() (bool, func())`
//! returns whether the event is handled and, if not, a closure the caller
//! must invoke after doing its work. That idiom exists to make "check and
//! claim" atomic under a single lock acquisition. The natural Rust
//! equivalent is a compare-and-swap on a boolean, which gives the same
//! atomicity without a callback: [`EventContext::claim`] returns `true`
//! exactly once, to exactly one caller.

use crate::prelude::*;

use std::sync::atomic::{AtomicBool, Ordering};

use matrix_sdk::ruma::OwnedEventId;

/// A single event in a thread, as returned by a backward-pagination query.
#[derive(Debug, Clone)]
pub struct ThreadEvent {
    /// Event id.
    pub event_id: OwnedEventId,
    /// Sender.
    pub sender: OwnedUserId,
    /// Body, if it is a text-bearing event.
    pub body: String,
}

/// Thread view for an event, built on demand and bounded to a configured
/// depth, reversed to chronological order.
#[derive(Debug, Clone)]
pub struct ThreadView {
    /// Room the thread belongs to.
    pub room_id: OwnedRoomId,
    /// Root event of the thread.
    pub root: OwnedEventId,
    /// Events in the thread, oldest first.
    pub events: Vec<ThreadEvent>,
}

/// Metadata resolved while building the context: thread id and in-reply-to
/// target, independent of whether a full [`ThreadView`] was loaded.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    /// Thread root id, if the event belongs to a thread.
    pub thread_id: Option<OwnedEventId>,
    /// Event this one replies to, if any.
    pub in_reply_to: Option<OwnedEventId>,
}

/// Execution context wrapping a single event as it is walked through the
/// dispatcher's handler list.
pub struct EventContext {
    /// The event being processed.
    pub event: Event,
    /// Matrix room handle, when the event is room-scoped.
    pub room: Option<Room>,
    /// Thread view, loaded only when thread reconstruction is enabled and a
    /// handler asked for it.
    pub thread: Option<ThreadView>,
    /// Thread-id/in-reply-to metadata.
    pub metadata: EventMetadata,
    handled: AtomicBool,
}

impl EventContext {
    /// Builds a fresh, unclaimed context for `event`.
    #[must_use]
    pub fn new(event: Event, room: Option<Room>, metadata: EventMetadata) -> Self {
        Self {
            event,
            room,
            thread: None,
            metadata,
            handled: AtomicBool::new(false),
        }
    }

    /// Attaches a thread view, e.g. after a handler requests it lazily.
    pub fn set_thread(&mut self, thread: ThreadView) {
        self.thread = Some(thread);
    }

    /// Attempts to claim this event for the calling handler.
    ///
    /// Returns `true` exactly once across however many handlers race to call
    /// it; every subsequent call returns `false`. A handler observing
    /// `false` must return immediately without performing side effects -
    /// another handler has already claimed the event.
    pub fn claim(&self) -> bool {
        self.handled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether some handler has already claimed this event, without
    /// attempting to claim it.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    /// Sends a plain-text reply in the event's room.
    ///
    /// # Errors
    /// Returns an error if the context has no room, or the send fails.
    pub async fn reply_text(&self, body: impl Into<String>) -> anyhow::Result<()> {
        let room = self
            .room
            .as_ref()
            .ok_or_else(|| anyhow!("context has no room to reply in"))?;
        room.send(RoomMessageEventContent::text_plain(body.into()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContent;
    use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;

    fn dummy_event() -> Event {
        Event {
            event_id: OwnedEventId::try_from("$ev:example.org").unwrap(),
            room_id: None,
            sender: UserId::parse("@alice:example.org").unwrap().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            kind: EventKind::RoomMessage,
            content: EventContent::default(),
        }
    }

    #[test]
    fn only_one_caller_wins_the_claim() {
        let ctx = EventContext::new(dummy_event(), None, EventMetadata::default());
        assert!(ctx.claim());
        assert!(!ctx.claim());
        assert!(ctx.is_handled());
    }

    #[test]
    fn unclaimed_context_does_not_report_handled() {
        let ctx = EventContext::new(dummy_event(), None, EventMetadata::default());
        assert!(!ctx.is_handled());
    }
}
