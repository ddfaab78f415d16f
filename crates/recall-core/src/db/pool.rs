//! SQLite pool settings for the session ledger.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;

const MEMORY_PATH: &str = ":memory:";

/// True for paths that open a private in-memory database.
pub fn is_in_memory(path: &str) -> bool {
    path.starts_with(MEMORY_PATH) || path.contains("mode=memory")
}

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Timeout for acquiring a connection.
    pub acquire_timeout: Duration,
    /// Connections are recycled after this long; `None` keeps them forever.
    pub recycle_after: Option<Duration>,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
    /// Page cache per connection, in KB.
    pub cache_size_kb: i64,
    pub journal: SqliteJournalMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            recycle_after: Some(Duration::from_secs(1800)),
            busy_timeout: Duration::from_secs(30),
            cache_size_kb: 8000,
            journal: SqliteJournalMode::Wal,
        }
    }
}

impl PoolConfig {
    /// Settings suited to `path`: file ledgers get WAL and a small pool, an
    /// in-memory ledger gets [`PoolConfig::in_memory`].
    pub fn for_path(path: &str) -> Self {
        if is_in_memory(path) {
            Self::in_memory()
        } else {
            Self::default()
        }
    }

    /// One connection that is never closed.
    ///
    /// Every new connection to `:memory:` is a fresh empty database, so the
    /// pool must hold exactly one for its whole life.
    pub fn in_memory() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            recycle_after: None,
            busy_timeout: Duration::from_secs(5),
            cache_size_kb: 2000,
            journal: SqliteJournalMode::Memory,
        }
    }

    /// Build the connection options for SQLite.
    pub fn build_connect_options(&self, path: &str) -> Result<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(self.journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .foreign_keys(true)
            .pragma("cache_size", format!("-{}", self.cache_size_kb));

        Ok(options)
    }

    /// Build the pool options.
    pub fn build_pool_options(&self) -> SqlitePoolOptions {
        let opts = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(1)
            .acquire_timeout(self.acquire_timeout)
            .max_lifetime(self.recycle_after);

        match self.recycle_after {
            Some(after) => opts.idle_timeout(after),
            None => opts.idle_timeout(None).test_before_acquire(false),
        }
    }
}

/// Open a pool on `path`, creating the ledger file's directory if needed.
pub async fn create_pool_with_config(path: &str, config: PoolConfig) -> Result<super::DbPool> {
    if !is_in_memory(path) {
        let file = path.strip_prefix("sqlite://").unwrap_or(path);
        if let Some(parent) = std::path::Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
    }

    let pool = config
        .build_pool_options()
        .connect_with(config.build_connect_options(path)?)
        .await?;

    Ok(pool)
}

/// Health check for the database connection.
pub async fn health_check(pool: &super::DbPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(":memory:", true)]
    #[case("file:ledger?mode=memory&cache=shared", true)]
    #[case("./data/recall.db", false)]
    #[case("sqlite://data/recall.db", false)]
    fn test_is_in_memory(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_in_memory(path), expected);
    }

    #[test]
    fn test_pool_settings_follow_path() {
        let config = PoolConfig::for_path(":memory:");
        assert_eq!(config.max_connections, 1);
        assert!(config.recycle_after.is_none());

        let config = PoolConfig::for_path("./ledger.db");
        assert!(config.max_connections > 1);
        assert_eq!(config.journal, SqliteJournalMode::Wal);
    }

    #[tokio::test]
    async fn test_health_check() {
        let pool = create_pool_with_config(":memory:", PoolConfig::in_memory())
            .await
            .unwrap();
        health_check(&pool).await.unwrap();
        assert_eq!(pool.options().get_max_connections(), 1);
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("recall-pool-{}", recall_models::new_id()));
        let path = dir.join("ledger.db");
        let path = path.to_string_lossy().to_string();

        let pool = create_pool_with_config(&path, PoolConfig::for_path(&path))
            .await
            .unwrap();
        health_check(&pool).await.unwrap();
        pool.close().await;

        assert!(dir.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
