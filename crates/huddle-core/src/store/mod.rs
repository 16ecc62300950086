//! Persistent store.
//!
//! Three tables (users, rooms, messages) in SQLite. Query functions take a
//! `&mut SqliteConnection` so they compose inside one transaction; the
//! engine opens a transaction per command and commits it before anything is
//! broadcast.

pub mod messages;
pub mod rooms;
mod schema;
pub mod users;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

pub use messages::{MessageRow, NewMessage};
pub use users::UserRow;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://data/huddle.db` or `sqlite::memory:`.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/huddle.db".to_string(),
            max_connections: 4,
        }
    }
}

/// Handle to the database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) and migrate the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(config: &StoreConfig) -> Result<Self, sqlx::Error> {
        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // A memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;

        info!(url = %config.url, "Store ready");
        Ok(store)
    }

    /// A fresh private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot be initialised.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        Self::connect(&StoreConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        debug!(statements = schema::MIGRATIONS.len(), "Schema applied");
        Ok(())
    }

    /// Start a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Millisecond timestamp of a `DateTime`.
pub(crate) fn millis(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_has_system_user() {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        let system = users::find(&mut conn, huddle_protocol::SYSTEM_USER_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(system.name, "System");
        assert!(system.room_id.is_none());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.migrate().await.unwrap();
    }
}
