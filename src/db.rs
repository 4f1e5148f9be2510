//! Interface to Postgres-compatible databases, used by durable [`crate::dedup`]
//! storage and any service that wants a shared connection pool.
//!
//! # Configuration
//!
//! Pools are configured as `HashMap<name, deadpool_postgres::Config>` under
//! the `"db"` service-config key:
//!
//! ```toml
//! [service.db.main]
//! host = "host.example.org"
//! port = 5432
//! dbname = "database"
//! user = "user"
//! password = "password"
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use mxframe::prelude::*;
//! use mxframe::db::DBPools;
//!
//! async fn get_instance_id() -> anyhow::Result<i64> {
//!     let client = DBPools::get_client("main").await?;
//!     let statement = client.prepare_cached("SELECT nextval('_instance_id')").await?;
//!     let row = client.query_one(&statement, &[]).await?;
//!     row.try_get(0).map_err(|e: tokio_postgres::Error| anyhow!(e))
//! }
//! ```

use crate::config::ConfigError;
use crate::prelude::*;

use deadpool_postgres::{
    Client as DBClient, Config as PGConfig, ManagerConfig, Pool, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

static DB_CONNECTIONS: LazyLock<DBPools> = LazyLock::new(Default::default);

/// Named collection of pool configurations, one entry per handle.
pub type DBConfig = HashMap<String, PGConfig>;

/// Shared collection of named database connection pools.
#[derive(Default)]
pub struct DBPools(Arc<Mutex<HashMap<String, Pool>>>);

impl DBPools {
    pub(crate) fn get_pool(handle: &str) -> Result<Pool, DBError> {
        let Ok(dbc) = DB_CONNECTIONS.0.lock() else {
            return Err(DBError::CollectionLock);
        };

        match dbc.get(handle) {
            Some(p) if !p.is_closed() => Ok(p.clone()),
            _ => Err(DBError::HandleNotFound),
        }
    }

    /// Acquires a client for a database by handle.
    ///
    /// # Errors
    /// Will return `Err` if acquiring the pool collection lock fails, the
    /// requested handle is unknown, or acquiring a client from the pool
    /// fails.
    pub async fn get_client(handle: &str) -> Result<DBClient, DBError> {
        let pool = {
            let Ok(dbc) = DB_CONNECTIONS.0.lock() else {
                return Err(DBError::CollectionLock);
            };

            match dbc.get(handle) {
                Some(p) if !p.is_closed() => p.clone(),
                _ => return Err(DBError::HandleNotFound),
            }
        };

        pool.get().await.map_err(|_| DBError::GetClient)
    }

    /// Creates (or recreates) pools from `config`'s `"db"` service config.
    /// A missing `"db"` section is not an error: it just means no pools are
    /// configured, which is fine for bots that only use in-memory dedup.
    ///
    /// # Errors
    /// Returns `Err` if the `"db"` section exists but fails to deserialize.
    pub fn init(config: &Config) -> anyhow::Result<()> {
        let module_config: DBConfig = match config.typed_service_config("db") {
            Ok(c) => c,
            Err(ConfigError::NoServiceConfig(_)) => {
                debug!("no db pools configured");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut dbc = DB_CONNECTIONS.0.lock().unwrap();
        for (name, pool) in dbc.iter() {
            info!("closing db conn: {name}");
            pool.close();
        }
        dbc.clear();

        for (name, mut dbcfg) in module_config {
            info!("new db conn: {name}");
            dbcfg.manager = Some(ManagerConfig {
                recycling_method: RecyclingMethod::Verified,
            });

            let Ok(pool) = dbcfg.create_pool(Some(Runtime::Tokio1), NoTls) else {
                error!("couldn't create database pool for {name}");
                continue;
            };

            dbc.insert(name, pool);
        }

        Ok(())
    }
}

/// Database pool errors.
#[derive(Debug)]
pub enum DBError {
    /// Couldn't acquire connection collection lock.
    CollectionLock,
    /// Database known under the handle not found in configuration.
    HandleNotFound,
    /// Acquiring database client from the pool failed.
    GetClient,
}

impl StdError for DBError {}

impl fmt::Display for DBError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CollectionLock => write!(fmt, "Couldn't acquire connection collection lock"),
            Self::HandleNotFound => write!(fmt, "Handle not found in connections"),
            Self::GetClient => write!(fmt, "Couldn't get client from pool"),
        }
    }
}
