//! Exactly-once event processing via lease-based deduplication.
//!
//! Every event that reaches a worker must first be claimed with
//! [`Dedup::try_start_processing`]. The dedup record transitions
//! `(absent) -> inflight -> processed`, and `processed` is terminal: no
//! operation ever moves a record back out of it. An inflight lease that
//! expires before [`Dedup::mark_processed`] is called becomes reclaimable by
//! the next caller, which is what makes this safe across a worker crash.
//!
//! Two implementations are provided: [`InMemoryDedup`], backed by a mutex and
//! a periodic sweep, and [`PostgresDedup`], backed by a conditional upsert
//! against a durable table (see [`crate::db`]).

use crate::prelude::*;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;

/// Identifies a dedup record: a (bot-user, event) pair, never a bare event-id.
///
/// Keying per-user rather than globally lets two bot processes share a
/// durable store without cross-contaminating each other's dedup state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// The bot's own Matrix user id.
    pub bot_user_id: OwnedUserId,
    /// The event being deduplicated.
    pub event_id: OwnedEventId,
}

impl DedupKey {
    /// Builds a dedup key for the given bot identity and event.
    #[must_use]
    pub fn new(bot_user_id: OwnedUserId, event_id: OwnedEventId) -> Self {
        Self {
            bot_user_id,
            event_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Inflight,
    Processed,
}

#[derive(Debug, Clone)]
struct Record {
    status: Status,
    lease_until: Option<Instant>,
}

/// Dedup store contract. Implementations must be safe to share across
/// workers via `Arc`.
#[async_trait]
pub trait Dedup: Send + Sync {
    /// Attempts to claim `key` for processing.
    ///
    /// Returns `true` ("claimed") if no record exists, the existing record's
    /// lease has expired, or the record never existed; returns `false`
    /// ("skip") if the record is already `processed`, or `inflight` with a
    /// still-live lease.
    async fn try_start_processing(&self, key: &DedupKey, ttl: Duration) -> anyhow::Result<bool>;

    /// Upserts `key` as `processed`. Idempotent; never downgrades a
    /// processed record back to inflight.
    async fn mark_processed(&self, key: &DedupKey) -> anyhow::Result<()>;

    /// Clears the lease on `key` if its status is not `processed`. Idempotent.
    async fn unmark_inflight(&self, key: &DedupKey) -> anyhow::Result<()>;

    /// Reports whether `key` is currently `processed`. Monotone: once true,
    /// stays true.
    async fn is_processed(&self, key: &DedupKey) -> anyhow::Result<bool>;
}

/// In-memory reference implementation: a mutex-guarded map plus a periodic
/// sweeper that drops expired inflight entries so the map doesn't grow
/// unbounded.
#[derive(Default)]
pub struct InMemoryDedup {
    records: Mutex<HashMap<DedupKey, Record>>,
}

impl InMemoryDedup {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a background task that periodically removes inflight records
    /// whose lease has expired. Processed records are never swept.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut records = this.records.lock().unwrap();
                records.retain(|_, r| match r.status {
                    Status::Processed => true,
                    Status::Inflight => r.lease_until.is_none_or(|l| l > now),
                });
                trace!("dedup sweep: {} records remaining", records.len());
            }
        });
    }
}

#[async_trait]
impl Dedup for InMemoryDedup {
    async fn try_start_processing(&self, key: &DedupKey, ttl: Duration) -> anyhow::Result<bool> {
        let mut records = self.records.lock().unwrap();
        let now = Instant::now();

        match records.get(key) {
            None => {
                records.insert(
                    key.clone(),
                    Record {
                        status: Status::Inflight,
                        lease_until: Some(now + ttl),
                    },
                );
                Ok(true)
            }
            Some(Record {
                status: Status::Processed,
                ..
            }) => Ok(false),
            Some(Record {
                status: Status::Inflight,
                lease_until: Some(lease),
            }) if *lease > now => Ok(false),
            Some(Record {
                status: Status::Inflight,
                ..
            }) => {
                records.insert(
                    key.clone(),
                    Record {
                        status: Status::Inflight,
                        lease_until: Some(now + ttl),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn mark_processed(&self, key: &DedupKey) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(
            key.clone(),
            Record {
                status: Status::Processed,
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn unmark_inflight(&self, key: &DedupKey) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.get_mut(key) {
            if r.status != Status::Processed {
                r.lease_until = None;
            }
        }
        Ok(())
    }

    async fn is_processed(&self, key: &DedupKey) -> anyhow::Result<bool> {
        let records = self.records.lock().unwrap();
        Ok(matches!(
            records.get(key),
            Some(Record {
                status: Status::Processed,
                ..
            })
        ))
    }
}

/// Durable reference implementation, backed by a relational table with a
/// unique index on `(user_id, event_id)`. See `matrix_event_dedup` in the
/// top-level persisted-state layout.
pub struct PostgresDedup {
    pool_handle: String,
}

impl PostgresDedup {
    /// Builds a store talking to the pool registered under `pool_handle` in
    /// [`crate::db::DBPools`].
    #[must_use]
    pub fn new(pool_handle: impl Into<String>) -> Self {
        Self {
            pool_handle: pool_handle.into(),
        }
    }
}

#[async_trait]
impl Dedup for PostgresDedup {
    async fn try_start_processing(&self, key: &DedupKey, ttl: Duration) -> anyhow::Result<bool> {
        let client = DBPools::get_client(&self.pool_handle).await?;
        let ttl_secs: i64 = ttl.as_secs().try_into().unwrap_or(i64::MAX);

        let stmt = client
            .prepare_cached(
                "INSERT INTO matrix_event_dedup (user_id, event_id, status, lease_until, updated_at) \
                 VALUES ($1, $2, 'inflight', now() + ($3 || ' seconds')::interval, now()) \
                 ON CONFLICT (user_id, event_id) DO UPDATE SET \
                   lease_until = now() + ($3 || ' seconds')::interval, updated_at = now() \
                 WHERE matrix_event_dedup.status <> 'processed' \
                   AND (matrix_event_dedup.lease_until IS NULL OR matrix_event_dedup.lease_until < now()) \
                 RETURNING 1",
            )
            .await?;

        let params: [&(dyn ToSql + Sync); 3] = [
            &key.bot_user_id.as_str(),
            &key.event_id.as_str(),
            &ttl_secs.to_string(),
        ];
        let rows = client.query(&stmt, &params).await?;
        Ok(!rows.is_empty())
    }

    async fn mark_processed(&self, key: &DedupKey) -> anyhow::Result<()> {
        let client = DBPools::get_client(&self.pool_handle).await?;
        let stmt = client
            .prepare_cached(
                "INSERT INTO matrix_event_dedup (user_id, event_id, status, lease_until, processed_at, updated_at) \
                 VALUES ($1, $2, 'processed', NULL, now(), now()) \
                 ON CONFLICT (user_id, event_id) DO UPDATE SET \
                   status = 'processed', lease_until = NULL, processed_at = now(), updated_at = now()",
            )
            .await?;
        client
            .execute(&stmt, &[&key.bot_user_id.as_str(), &key.event_id.as_str()])
            .await?;
        Ok(())
    }

    async fn unmark_inflight(&self, key: &DedupKey) -> anyhow::Result<()> {
        let client = DBPools::get_client(&self.pool_handle).await?;
        let stmt = client
            .prepare_cached(
                "UPDATE matrix_event_dedup SET lease_until = NULL, updated_at = now() \
                 WHERE user_id = $1 AND event_id = $2 AND status <> 'processed'",
            )
            .await?;
        client
            .execute(&stmt, &[&key.bot_user_id.as_str(), &key.event_id.as_str()])
            .await?;
        Ok(())
    }

    async fn is_processed(&self, key: &DedupKey) -> anyhow::Result<bool> {
        let client = DBPools::get_client(&self.pool_handle).await?;
        let stmt = client
            .prepare_cached(
                "SELECT 1 FROM matrix_event_dedup WHERE user_id = $1 AND event_id = $2 AND status = 'processed'",
            )
            .await?;
        let rows = client
            .query(&stmt, &[&key.bot_user_id.as_str(), &key.event_id.as_str()])
            .await?;
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> DedupKey {
        DedupKey::new(
            UserId::parse("@bot:example.org").unwrap().to_owned(),
            OwnedEventId::try_from(format!("$event{n}:example.org")).unwrap(),
        )
    }

    #[tokio::test]
    async fn duplicate_delivery_is_claimed_once() {
        let dedup = InMemoryDedup::new();
        let k = key("1");

        assert!(dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
        dedup.mark_processed(&k).await.unwrap();

        assert!(!dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
        assert!(dedup.is_processed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let dedup = InMemoryDedup::new();
        let k = key("2");

        dedup.mark_processed(&k).await.unwrap();
        dedup.mark_processed(&k).await.unwrap();
        assert!(dedup.is_processed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn unmark_inflight_never_reopens_processed() {
        let dedup = InMemoryDedup::new();
        let k = key("3");

        dedup.mark_processed(&k).await.unwrap();
        dedup.unmark_inflight(&k).await.unwrap();

        assert!(!dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let dedup = InMemoryDedup::new();
        let k = key("4");

        assert!(dedup.try_start_processing(&k, Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn live_lease_blocks_second_claim() {
        let dedup = InMemoryDedup::new();
        let k = key("5");

        assert!(dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
        assert!(!dedup.try_start_processing(&k, Duration::from_secs(30)).await.unwrap());
    }
}
