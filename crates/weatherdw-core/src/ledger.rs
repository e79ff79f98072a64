//! Load-run ledger: one row per attempt to load a source file.
//!
//! The ledger is the high-water mark that makes re-runs safe. `committed_rows` is
//! advanced inside each fact batch's transaction, so it always equals the number of
//! that run's fact rows actually persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{LoadError, Result};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadRun {
    pub load_id: Uuid,
    pub source_hash: String,
    pub source_path: String,
    pub total_rows: u64,
    pub committed_rows: u64,
    pub batch_size: usize,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

const RUN_COLUMNS: &str = "load_id, source_hash, source_path, total_rows, committed_rows, \
                           batch_size, status, started_at, finished_at, error";

fn run_from_row(row: &PgRow) -> Result<LoadRun> {
    let status: String = row.try_get("status")?;
    let total_rows: i64 = row.try_get("total_rows")?;
    let committed_rows: i64 = row.try_get("committed_rows")?;
    let batch_size: i32 = row.try_get("batch_size")?;

    Ok(LoadRun {
        load_id: row.try_get("load_id")?,
        source_hash: row.try_get("source_hash")?,
        source_path: row.try_get("source_path")?,
        total_rows: total_rows as u64,
        committed_rows: committed_rows as u64,
        batch_size: batch_size as usize,
        status: RunStatus::from_str(&status).ok_or_else(|| LoadError::SchemaConflict {
            table: "load_runs".into(),
            reason: format!("unknown run status {status:?}"),
        })?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
    })
}

/// The completed run of this exact file, if it was ever fully loaded.
pub async fn find_completed(pool: &DbPool, source_hash: &str) -> Result<Option<LoadRun>> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM load_runs
         WHERE source_hash = $1 AND status = 'completed'
         ORDER BY finished_at DESC
         LIMIT 1"
    ))
    .bind(source_hash)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// The most recent unfinished run of this file, which a new attempt can continue.
pub async fn find_resumable(pool: &DbPool, source_hash: &str) -> Result<Option<LoadRun>> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM load_runs
         WHERE source_hash = $1 AND status <> 'completed'
         ORDER BY started_at DESC
         LIMIT 1"
    ))
    .bind(source_hash)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

pub async fn open(
    pool: &DbPool,
    source_hash: &str,
    source_path: &str,
    total_rows: u64,
    batch_size: usize,
) -> Result<LoadRun> {
    let run = LoadRun {
        load_id: Uuid::new_v4(),
        source_hash: source_hash.to_string(),
        source_path: source_path.to_string(),
        total_rows,
        committed_rows: 0,
        batch_size,
        status: RunStatus::Running,
        started_at: Utc::now(),
        finished_at: None,
        error: None,
    };

    sqlx::query(
        r#"
        INSERT INTO load_runs
            (load_id, source_hash, source_path, total_rows, committed_rows, batch_size, status, started_at)
        VALUES ($1, $2, $3, $4, 0, $5, $6, $7)
        "#,
    )
    .bind(run.load_id)
    .bind(&run.source_hash)
    .bind(&run.source_path)
    .bind(run.total_rows as i64)
    .bind(batch_size_i32(batch_size)?)
    .bind(run.status.as_str())
    .bind(run.started_at)
    .execute(pool)
    .await?;

    Ok(run)
}

/// Mark an unfinished run as running again under the current batch size.
pub async fn reopen(pool: &DbPool, run: &mut LoadRun, batch_size: usize) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE load_runs
        SET status = 'running', batch_size = $2, finished_at = NULL, error = NULL
        WHERE load_id = $1
        "#,
    )
    .bind(run.load_id)
    .bind(batch_size_i32(batch_size)?)
    .execute(pool)
    .await?;

    run.status = RunStatus::Running;
    run.batch_size = batch_size;
    run.finished_at = None;
    run.error = None;
    Ok(())
}

/// Advance the high-water mark. Meant to run inside the batch's own transaction.
pub async fn record_progress(
    conn: &mut PgConnection,
    load_id: Uuid,
    committed_rows: u64,
) -> Result<()> {
    sqlx::query("UPDATE load_runs SET committed_rows = $2 WHERE load_id = $1")
        .bind(load_id)
        .bind(committed_rows as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn finish(
    pool: &DbPool,
    load_id: Uuid,
    status: RunStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE load_runs
        SET status = $2, finished_at = $3, error = $4
        WHERE load_id = $1
        "#,
    )
    .bind(load_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent(pool: &DbPool, limit: i64) -> Result<Vec<LoadRun>> {
    let rows = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM load_runs ORDER BY started_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_from_row).collect()
}

fn batch_size_i32(batch_size: usize) -> Result<i32> {
    i32::try_from(batch_size)
        .map_err(|_| LoadError::Config(format!("batch_size {batch_size} is too large")))
}
