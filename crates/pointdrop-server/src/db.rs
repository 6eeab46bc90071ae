//! Database connection and pool management.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::DatabaseConfig;

/// Parses `database_url` and applies the per-connection statement timeout.
///
/// A statement cancelled by the timeout fails with SQLSTATE 57014, which the
/// stores report as transient.
pub fn connect_options(database_url: &str, config: &DatabaseConfig) -> Result<PgConnectOptions, sqlx::Error> {
    let timeout_ms = config.statement_timeout_secs.saturating_mul(1000);
    Ok(PgConnectOptions::from_str(database_url)?.options([("statement_timeout", timeout_ms)]))
}

/// Creates a database connection pool.
///
/// # Arguments
/// * `database_url` - PostgreSQL connection string
/// * `config` - Pool size, acquire timeout and statement timeout
///
/// # Returns
/// A configured PgPool ready for use.
pub async fn create_pool(database_url: &str, config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(connect_options(database_url, config)?)
        .await
}

/// Runs all pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
