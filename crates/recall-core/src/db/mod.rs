//! Session ledger storage.
//!
//! SQLite connection pooling plus the query functions for agent sessions,
//! stage executions and handoffs.

mod pool;
mod sessions;

pub use pool::*;
pub use sessions::*;

use crate::Result;
use tracing::info;

/// Type alias for the SQLite connection pool.
pub type DbPool = sqlx::SqlitePool;

/// Initialize the database connection pool.
///
/// File ledgers run in WAL mode with a busy timeout; `:memory:` gets a
/// single long-lived connection.
pub async fn init_pool(path: &str) -> Result<DbPool> {
    let pool = create_pool_with_config(path, PoolConfig::for_path(path)).await?;

    info!("Database pool initialized: {}", path);

    Ok(pool)
}

/// Initialize the database schema.
///
/// Applies the complete schema from schema.sql. Uses IF NOT EXISTS
/// clauses so it's safe to run multiple times.
pub async fn initialize_schema(pool: &DbPool) -> Result<()> {
    info!("Initializing database schema");

    apply_schema(pool, include_str!("../../schema.sql")).await?;

    info!("Database schema initialized successfully");

    Ok(())
}

/// Run every statement of `schema` in order.
pub async fn apply_schema(pool: &DbPool, schema: &str) -> Result<()> {
    for statement in schema_statements(schema) {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

/// Split a schema script into statements.
///
/// Comment lines are dropped before splitting on `;`, so a semicolon inside
/// a comment never ends a statement.
fn schema_statements(schema: &str) -> Vec<String> {
    let sql: String = schema
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(String::from)
        .collect()
}

/// In-memory ledger with the schema applied.
pub async fn init_memory_ledger() -> Result<DbPool> {
    let pool = create_pool_with_config(":memory:", PoolConfig::in_memory()).await?;
    initialize_schema(&pool).await?;
    Ok(pool)
}
