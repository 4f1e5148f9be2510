//! Backfill engine (§4.3): per-room sequential backward pagination that fills
//! in history the live sync stream never delivers (events from before the
//! bot joined, or from before a configured floor), sharing the same router
//! and dedup store as live sync so the two can never double-deliver.

use crate::prelude::*;

use crate::dedup::{Dedup, DedupKey};
use crate::dispatcher::Dispatcher;
use crate::joinstore::JoinStore;
use crate::metrics::{BACKFILL_OUTCOMES, DEDUP_OUTCOMES};
use crate::router::{EventRouter, RouteOutcome};

use matrix_sdk::room::MessagesOptions;
use matrix_sdk::ruma::events::AnySyncMessageLikeEvent;
use matrix_sdk::ruma::events::AnySyncTimelineEvent;
use matrix_sdk::ruma::events::SyncMessageLikeEvent;

/// Runs one room's backward pagination to completion.
pub struct Backfill {
    client: Client,
    router: Arc<EventRouter>,
    dispatcher: Arc<Dispatcher>,
    dedup: Arc<dyn Dedup>,
    join_store: Arc<JoinStore>,
    bot_user_id: OwnedUserId,
    page_limit: u32,
}

impl Backfill {
    /// Builds a backfill runner sharing the live-sync router, dispatcher,
    /// and dedup store.
    #[must_use]
    pub fn new(
        client: Client,
        router: Arc<EventRouter>,
        dispatcher: Arc<Dispatcher>,
        dedup: Arc<dyn Dedup>,
        join_store: Arc<JoinStore>,
        bot_user_id: OwnedUserId,
        page_limit: u32,
    ) -> Self {
        Self {
            client,
            router,
            dispatcher,
            dedup,
            join_store,
            bot_user_id,
            page_limit,
        }
    }

    /// Spawns one backfill task per currently-joined room, bounded by
    /// `patch_start_millis` when set. Rooms are enumerated from the client
    /// directly rather than the join store, so this also covers rooms the
    /// bot was already in before this process started (and so never saw a
    /// membership event for). Each room paginates independently and
    /// concurrently; within a room, delivery is oldest-first.
    pub fn spawn_for_known_rooms(self: &Arc<Self>, patch_start_millis: Option<i64>) {
        for room in self.client.joined_rooms() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let room_id = room.room_id().to_owned();
                match this.run_for_room(room, patch_start_millis).await {
                    Ok(()) => BACKFILL_OUTCOMES.with_label_values(&["completed"]).inc(),
                    Err(e) => {
                        error!(room = %room_id, "backfill failed: {e}");
                        BACKFILL_OUTCOMES.with_label_values(&["failed"]).inc();
                    }
                }
            });
        }
    }

    async fn run_for_room(&self, room: Room, patch_start_millis: Option<i64>) -> anyhow::Result<()> {
        let room_id = room.room_id().to_owned();
        let cursor = self.join_store.get(&room_id).unwrap_or_default();
        let Some(from) = cursor.prev_batch.clone() else {
            debug!(room = %room_id, "no prev-batch token, skipping backfill");
            return Ok(());
        };

        let join_ts_millis = cursor.join_ts.map(|ts| i64::from(ts.get()));
        if join_ts_millis.is_none() && patch_start_millis.is_none() {
            debug!(room = %room_id, "no join timestamp or patch start configured, skipping backfill");
            return Ok(());
        }

        let floor = Self::floor_for(join_ts_millis, patch_start_millis);

        info!(room = %room_id, floor, "starting backfill");

        let mut next_from = Some(from);

        loop {
            let mut page_options = MessagesOptions::backward();
            page_options.from = next_from.clone();
            page_options.limit = self.page_limit.into();

            let response = room.messages(page_options).await?;
            if response.chunk.is_empty() {
                break;
            }

            // Server returns newest-first within a page; reverse so we
            // deliver oldest-first, matching live-sync ordering.
            let mut reached_floor = false;
            for timeline_event in response.chunk.into_iter().rev() {
                let Ok(any_event) = timeline_event.raw().deserialize() else {
                    continue;
                };
                let Some(event) = self.convert(any_event, &room_id) else {
                    continue;
                };

                if event.timestamp_millis() < floor {
                    reached_floor = true;
                    continue;
                }

                self.deliver(event, room.clone()).await;
            }

            if reached_floor {
                break;
            }

            next_from = response.end;
            if next_from.is_none() {
                break;
            }
        }

        info!(room = %room_id, "backfill complete");
        Ok(())
    }

    fn convert(&self, any_event: AnySyncTimelineEvent, room_id: &OwnedRoomId) -> Option<Event> {
        match any_event {
            AnySyncTimelineEvent::MessageLike(AnySyncMessageLikeEvent::RoomMessage(
                SyncMessageLikeEvent::Original(ev),
            )) => Event::try_from((ev, room_id.clone())).ok(),
            AnySyncTimelineEvent::MessageLike(AnySyncMessageLikeEvent::RoomEncrypted(
                SyncMessageLikeEvent::Original(ev),
            )) => Event::try_from((ev, room_id.clone())).ok(),
            _ => None,
        }
    }

    #[must_use]
    fn floor_for(join_ts_millis: Option<i64>, patch_start_millis: Option<i64>) -> i64 {
        join_ts_millis.unwrap_or(0).max(patch_start_millis.unwrap_or(i64::MIN))
    }

    async fn deliver(&self, event: Event, room: Room) {
        let key = DedupKey::new(self.bot_user_id.clone(), event.event_id.clone());

        match self.dedup.try_start_processing(&key, Duration::from_secs(300)).await {
            Ok(true) => DEDUP_OUTCOMES.with_label_values(&["claimed"]).inc(),
            Ok(false) => {
                DEDUP_OUTCOMES.with_label_values(&["skipped"]).inc();
                return;
            }
            Err(e) => {
                DEDUP_OUTCOMES.with_label_values(&["error"]).inc();
                error!("backfill dedup claim failed: {e}");
                return;
            }
        }

        match self.router.route_historical(event, room).await {
            RouteOutcome::Dropped => {
                if let Err(e) = self.dedup.unmark_inflight(&key).await {
                    error!("backfill unmark_inflight failed: {e}");
                }
            }
            RouteOutcome::Context(ctx) => {
                self.dispatcher.dispatch(ctx).await;
                if let Err(e) = self.dedup.mark_processed(&key).await {
                    error!("backfill mark_processed failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Backfill;

    #[test]
    fn floor_is_the_later_of_join_and_patch_start() {
        assert_eq!(Backfill::floor_for(Some(1000), Some(2000)), 2000);
        assert_eq!(Backfill::floor_for(Some(2000), Some(1000)), 2000);
    }

    #[test]
    fn floor_defaults_to_zero_without_join_ts_or_patch_start() {
        assert_eq!(Backfill::floor_for(None, None), 0);
    }

    #[test]
    fn floor_falls_back_to_join_ts_without_patch_start() {
        assert_eq!(Backfill::floor_for(Some(500), None), 500);
    }
}
