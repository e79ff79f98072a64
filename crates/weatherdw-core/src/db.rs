use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::{info, warn};

use crate::config::{ConnectionSettings, RetryPolicy};
use crate::error::{LoadError, Result};

pub type DbPool = Pool<Postgres>;

/// Open the connection pool for one load session.
///
/// The pool holds a single connection: a load owns its connection exclusively and
/// never runs statements concurrently. Transient failures are retried according to
/// `retry`; everything else fails immediately as [`LoadError::ConnectionFailure`].
pub async fn connect(settings: &ConnectionSettings, retry: &RetryPolicy) -> Result<DbPool> {
    let options = settings.connect_options()?;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.clone())
            .await;

        match result {
            Ok(pool) => {
                info!(attempt, "Warehouse connection established");
                return Ok(pool);
            }
            Err(err) if is_transient(&err) && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient connection failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(LoadError::ConnectionFailure {
                    attempts: attempt,
                    source: err,
                })
            }
        }
    }
}

/// Whether a driver error is worth retrying: lost or refused connections and
/// server-side connection exceptions. Integrity and syntax errors never are.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            // 08xxx connection exception, 57P01..57P03 shutdown/cannot connect now,
            // 53300 too many connections.
            code.starts_with("08") || code.starts_with("57P0") || code == "53300"
        }),
        _ => false,
    }
}
