//! The warehouse loading pipeline: schema, date dimension, station dimension, facts.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LoaderConfig;
use crate::db::DbPool;
use crate::dimensions::{
    load_dimension, DateProjection, DimensionLoadSummary, DistinctKeys, StationProjection,
};
use crate::error::{LoadError, Result};
use crate::facts::{load_facts, FactLoadOptions, FactLoadSummary};
use crate::ledger::{self, LoadRun, RunStatus};
use crate::progress::{LoadProgress, ProgressSink, Stage, TracingProgress};
use crate::registry::{Registries, SurrogateKeyRegistry};
use crate::schema;
use crate::source::SourceFile;
use crate::types::Dimension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// A fresh run loaded the whole file.
    Loaded,
    /// An unfinished earlier run of the same file was continued.
    Resumed,
    /// The file had already been loaded completely; nothing was written.
    AlreadyLoaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub load_id: Uuid,
    pub source_path: String,
    pub source_hash: String,
    pub status: LoadStatus,
    pub source_rows: u64,
    pub date_dimension: Option<DimensionLoadSummary>,
    pub station_dimension: Option<DimensionLoadSummary>,
    pub facts: Option<FactLoadSummary>,
}

/// Everything the dimension pass learns about a source file.
struct SourceScan {
    rows: u64,
    dates: DistinctKeys<DateProjection>,
    stations: DistinctKeys<StationProjection>,
}

/// Drives one load session over a shared connection pool.
///
/// The registries built during a load live only inside [`WarehouseLoader::load`] and
/// are dropped when it returns.
pub struct WarehouseLoader<'a> {
    pool: &'a DbPool,
    config: LoaderConfig,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<'a> WarehouseLoader<'a> {
    pub fn new(pool: &'a DbPool, config: LoaderConfig) -> Self {
        Self {
            pool,
            config,
            progress: Arc::new(TracingProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load one source file into the warehouse.
    ///
    /// Stages run strictly in order and each must finish before the next starts. The
    /// first fatal error stops the load; fact batches committed before it stay persisted
    /// and are recorded in the ledger so a later call can resume after them.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        self.config.validate()?;
        let source = SourceFile::new(path.as_ref(), self.config.delimiter_byte()?);
        let source_path = source.path().display().to_string();

        self.stage(Stage::Schema);
        schema::ensure_schema(self.pool).await?;

        let source_hash = source.fingerprint()?;
        if let Some(run) = ledger::find_completed(self.pool, &source_hash).await? {
            info!(
                load_id = %run.load_id,
                source = %source_path,
                "Source file already loaded, skipping"
            );
            return Ok(LoadReport {
                load_id: run.load_id,
                source_path,
                source_hash,
                status: LoadStatus::AlreadyLoaded,
                source_rows: run.total_rows,
                date_dimension: None,
                station_dimension: None,
                facts: None,
            });
        }

        let resumable = if self.config.resume {
            ledger::find_resumable(self.pool, &source_hash).await?
        } else {
            None
        };

        self.stage(Stage::SourceScan);
        let already_committed = resumable.as_ref().map_or(0, |run| run.committed_rows);
        let scan = scan_source(&source, &self.cancel, already_committed)?;
        self.progress.on_progress(&LoadProgress::SourceScanned {
            rows: scan.rows,
            distinct_dates: scan.dates.len(),
            distinct_stations: scan.stations.len(),
        });

        let (run, status) = match resumable {
            Some(mut run) => {
                ledger::reopen(self.pool, &mut run, self.config.batch_size).await?;
                info!(
                    load_id = %run.load_id,
                    committed_rows = run.committed_rows,
                    "Resuming unfinished load"
                );
                (run, LoadStatus::Resumed)
            }
            None => {
                let run = ledger::open(
                    self.pool,
                    &source_hash,
                    &source_path,
                    scan.rows,
                    self.config.batch_size,
                )
                .await?;
                (run, LoadStatus::Loaded)
            }
        };

        match self.load_run(&source, &scan, &run).await {
            Ok((dates, stations, facts)) => {
                ledger::finish(self.pool, run.load_id, RunStatus::Completed, None).await?;
                self.progress.on_progress(&LoadProgress::Finished {
                    committed_rows: facts.committed_rows,
                });
                Ok(LoadReport {
                    load_id: run.load_id,
                    source_path,
                    source_hash,
                    status,
                    source_rows: scan.rows,
                    date_dimension: Some(dates),
                    station_dimension: Some(stations),
                    facts: Some(facts),
                })
            }
            Err(err) => {
                let run_status = match err {
                    LoadError::Cancelled { .. } => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                let message = err.to_string();
                warn!(
                    load_id = %run.load_id,
                    data_integrity = err.is_data_integrity(),
                    error = %message,
                    "Load stopped"
                );
                if let Err(ledger_err) =
                    ledger::finish(self.pool, run.load_id, run_status, Some(&message)).await
                {
                    warn!(error = %ledger_err, "Could not record failed load in the ledger");
                }
                Err(err)
            }
        }
    }

    async fn load_run(
        &self,
        source: &SourceFile,
        scan: &SourceScan,
        run: &LoadRun,
    ) -> Result<(DimensionLoadSummary, DimensionLoadSummary, FactLoadSummary)> {
        let mut registries = Registries {
            dates: SurrogateKeyRegistry::with_capacity(Dimension::Date, scan.dates.len()),
            stations: SurrogateKeyRegistry::with_capacity(Dimension::Station, scan.stations.len()),
        };

        // A dimension stage commits no facts; report the run's high-water mark instead.
        let cancelled_here = |err: LoadError| match err {
            LoadError::Cancelled { .. } => LoadError::Cancelled {
                committed_rows: run.committed_rows,
            },
            other => other,
        };

        self.stage(Stage::DateDimension);
        let dates = load_dimension(self.pool, &scan.dates, &mut registries.dates, &self.cancel)
            .await
            .map_err(cancelled_here)?;
        self.dimension_loaded(&dates);

        self.stage(Stage::StationDimension);
        let stations = load_dimension(
            self.pool,
            &scan.stations,
            &mut registries.stations,
            &self.cancel,
        )
        .await
        .map_err(cancelled_here)?;
        self.dimension_loaded(&stations);

        self.stage(Stage::Facts);
        let options = FactLoadOptions {
            batch_size: self.config.batch_size,
            load_id: run.load_id,
            already_committed: run.committed_rows,
            total_rows: scan.rows,
        };
        let facts = load_facts(
            self.pool,
            source.rows()?,
            &registries,
            &options,
            self.progress.as_ref(),
            &self.cancel,
        )
        .await?;

        Ok((dates, stations, facts))
    }

    fn stage(&self, stage: Stage) {
        self.progress.on_progress(&LoadProgress::StageStarted { stage });
    }

    fn dimension_loaded(&self, summary: &DimensionLoadSummary) {
        self.progress.on_progress(&LoadProgress::DimensionLoaded {
            dimension: summary.dimension,
            distinct_keys: summary.distinct_keys,
            inserted: summary.inserted,
        });
    }
}

/// First pass: validate every row and collect the distinct dimension keys.
///
/// Runs before anything but the schema is written, so a malformed row or a station
/// attribute conflict anywhere in the file stops the load with an untouched warehouse.
/// `committed_rows` is only reported back if the scan is cancelled.
fn scan_source(
    source: &SourceFile,
    cancel: &CancellationToken,
    committed_rows: u64,
) -> Result<SourceScan> {
    let mut scan = SourceScan {
        rows: 0,
        dates: DistinctKeys::new(),
        stations: DistinctKeys::new(),
    };
    for row in source.rows()? {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled { committed_rows });
        }
        let row = row?;
        scan.dates.observe(&row)?;
        scan.stations.observe(&row)?;
        scan.rows += 1;
    }
    Ok(scan)
}
