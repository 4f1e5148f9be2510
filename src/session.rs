//! Login/restore and the on-disk sync cursor.
//!
//! Persisted state lives under `data_dir`:
//! * `device-id-<username>.txt` - the device id assigned on first login,
//!   reused on every restart so the Olm device (and its room keys) survive.
//! * `crypto-store-<username>.db` - the sqlite-backed crypto/state store.
//! * `syncstore/<username>/sync.json` - `{next_batch, filter_id}`.

use crate::config::{AuthMode, Config, ConfigError};
use crate::prelude::*;

use matrix_sdk::config::SyncSettings;
use matrix_sdk::ruma::api::client::filter::{FilterDefinition, RoomEventFilter, RoomFilter};
use matrix_sdk::ruma::UInt;

/// Sync cursor persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Token to resume `/sync` from. `None` on first ever run.
    pub next_batch: Option<String>,
    /// Filter id registered with the homeserver for this session, if any.
    pub filter_id: Option<String>,
}

impl SyncCursor {
    /// Loads a cursor from `path`, or an empty one if it doesn't exist or
    /// fails to parse.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&raw) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!("sync.json present but failed to parse, starting fresh: {e}");
                Self::default()
            }
        }
    }

    /// Persists the cursor atomically via temp-file + rename.
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

fn device_id_path(data_dir: &Path, username: &str) -> std::path::PathBuf {
    data_dir.join(format!("device-id-{username}.txt"))
}

fn crypto_store_path(data_dir: &Path, username: &str) -> std::path::PathBuf {
    data_dir.join(format!("crypto-store-{username}.db"))
}

/// Sync cursor file path for `username` under `data_dir`.
#[must_use]
pub fn sync_cursor_path(data_dir: &Path, username: &str) -> std::path::PathBuf {
    data_dir.join("syncstore").join(username).join("sync.json")
}

/// Join-cursor file path for `username` under `data_dir`.
#[must_use]
pub fn join_cursor_path(data_dir: &Path, username: &str) -> std::path::PathBuf {
    data_dir.join("syncstore").join(username).join("join.json")
}

/// Builds a logged-in [`Client`], reusing a previously persisted device id
/// and crypto store when present.
///
/// # Errors
/// Returns an error if the configured auth mode isn't implemented, if the
/// crypto store can't be opened, or if login fails.
pub async fn build_client(config: &Config) -> anyhow::Result<Client> {
    let creds = config.credentials();

    let AuthMode::Interactive = creds.auth_mode else {
        return Err(ConfigError::AuthModeUnsupported(format!("{:?}", creds.auth_mode)).into());
    };

    let data_dir_str = config.data_dir();
    let data_dir = Path::new(&data_dir_str);
    fs::create_dir_all(data_dir)?;

    let device_id_file = device_id_path(data_dir, &creds.username);
    let existing_device_id = fs::read_to_string(&device_id_file).ok();

    let store_path = crypto_store_path(data_dir, &creds.username);

    trace!("building client");
    let client = Client::builder()
        .homeserver_url(&creds.homeserver_url)
        .sqlite_store(&store_path, Some(&creds.pickle_key))
        .build()
        .await?;
    let auth = client.matrix_auth();

    let mut login = auth
        .login_username(&creds.username, &creds.password)
        .initial_device_display_name(&config.device_id());
    if let Some(device_id) = existing_device_id.as_deref() {
        login = login.device_id(device_id);
    }

    trace!("logging in");
    login.await?;

    if let Some(device_id) = client.device_id() {
        fs::write(&device_id_file, device_id.as_str())?;
    }

    Ok(client)
}

/// Builds [`SyncSettings`] for the initial `/sync`, resuming from a
/// persisted cursor if one exists, with a high per-room timeline limit so a
/// fresh bot doesn't miss recent history it could otherwise backfill.
const INITIAL_SYNC_TIMELINE_LIMIT: u32 = 500;

#[must_use]
pub fn initial_sync_settings(cursor: &SyncCursor) -> SyncSettings {
    let mut filter = FilterDefinition::default();
    let mut room_filter = RoomFilter::default();
    let mut timeline_filter = RoomEventFilter::default();
    timeline_filter.limit = UInt::new(u64::from(INITIAL_SYNC_TIMELINE_LIMIT));
    room_filter.timeline = timeline_filter;
    filter.room = room_filter;

    let mut settings = SyncSettings::default().filter(filter.into()).full_state(false);

    if let Some(token) = &cursor.next_batch {
        settings = settings.token(token.clone());
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_through_json() {
        let dir = std::env::temp_dir().join(format!("mxframe-session-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sync.json");

        let cursor = SyncCursor {
            next_batch: Some("tok1".to_string()),
            filter_id: Some("f1".to_string()),
        };
        cursor.persist(&path).unwrap();

        let loaded = SyncCursor::load(&path);
        assert_eq!(loaded.next_batch, Some("tok1".to_string()));
        assert_eq!(loaded.filter_id, Some("f1".to_string()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_cursor_file_loads_as_default() {
        let loaded = SyncCursor::load(Path::new("/nonexistent/sync.json"));
        assert!(loaded.next_batch.is_none());
    }
}
