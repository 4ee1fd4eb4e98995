//! Statistics store bootstrap.
//!
//! SYSTEM CONTEXT
//! ==============
//! The pool exists solely for the post-game statistics store. Startup calls
//! this when `DATABASE_URL` is set; when it is absent the server runs with
//! stats disabled and everything else intact.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
// Game results are written fire-and-forget; a slow database should fail the
// write, not pile up tasks waiting on connections.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect the statistics pool and bring its schema up to date. Pool size
/// comes from `STATS_DB_MAX_CONNECTIONS` when set.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = std::env::var("STATS_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;
    info!(max_connections, "stats store ready");
    Ok(pool)
}
