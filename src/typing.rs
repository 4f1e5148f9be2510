//! Refcounted per-room typing keep-alive.
//!
//! The protocol's typing indicator expires after roughly 30 s, so holding it
//! up during a long-running handler means periodically re-asserting it.
//! Refcounting exists because two handlers can be working in the same room
//! concurrently; the indicator must stay up until both are done, and only
//! the last one out sends `typing=false`.
//!
//! The refcount is an instance field of [`TypingKeepAlive`], not process-wide
//! state keyed by room-id - the source's global map is an implementation
//! leak of a single-bot-per-process assumption that doesn't hold once
//! multiple bot instances share a binary.

use crate::prelude::*;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns the per-room refcounts and hands out [`TypingGuard`]s.
#[derive(Default)]
pub struct TypingKeepAlive {
    refcounts: Mutex<HashMap<OwnedRoomId, usize>>,
}

impl TypingKeepAlive {
    /// Builds an empty keep-alive tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or joins) the typing indicator for `room`, re-asserting it
    /// every `timeout`. Returns a guard; call [`TypingGuard::stop`] when the
    /// handler is done.
    pub fn start(self: &Arc<Self>, room: Room, timeout: Duration) -> TypingGuard {
        let room_id = room.room_id().to_owned();

        {
            let mut counts = self.refcounts.lock().unwrap();
            *counts.entry(room_id.clone()).or_insert(0) += 1;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_room = room.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = task_room.typing_notice(true).await {
                warn!("typing=true send failed: {e}");
            }

            let mut ticker = tokio::time::interval(timeout);
            ticker.tick().await; // first tick fires immediately; we already sent once

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task_room.typing_notice(true).await {
                            warn!("typing=true refresh failed: {e}");
                        }
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }
        });

        TypingGuard {
            keepalive: Arc::clone(self),
            room,
            room_id,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    fn release(&self, room_id: &OwnedRoomId) -> bool {
        let mut counts = self.refcounts.lock().unwrap();
        match counts.get_mut(room_id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                counts.remove(room_id);
                true
            }
            None => true,
        }
    }
}

/// Handle returned by [`TypingKeepAlive::start`]. Dropping it without
/// calling [`Self::stop`] leaves the ticker running until process exit -
/// callers are expected to always call `stop`.
pub struct TypingGuard {
    keepalive: Arc<TypingKeepAlive>,
    room: Room,
    room_id: OwnedRoomId,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TypingGuard {
    /// Decrements the refcount; if it reaches zero, stops the ticker and
    /// sends a final `typing=false`.
    pub async fn stop(mut self) {
        let last = self.keepalive.release(&self.room_id);

        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        if last {
            if let Err(e) = self.room.typing_notice(false).await {
                warn!("typing=false send failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_releases_down_to_zero() {
        let keepalive = TypingKeepAlive::new();
        let room_id = OwnedRoomId::try_from("!room:example.org").unwrap();

        {
            let mut counts = keepalive.refcounts.lock().unwrap();
            *counts.entry(room_id.clone()).or_insert(0) += 1;
            *counts.entry(room_id.clone()).or_insert(0) += 1;
        }

        assert!(!keepalive.release(&room_id));
        assert!(keepalive.release(&room_id));
    }
}
