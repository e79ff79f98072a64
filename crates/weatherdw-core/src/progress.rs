use serde::Serialize;
use tracing::{debug, info};

use crate::types::Dimension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Schema,
    SourceScan,
    DateDimension,
    StationDimension,
    Facts,
}

/// Structured progress events emitted while a load runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoadProgress {
    StageStarted {
        stage: Stage,
    },
    SourceScanned {
        rows: u64,
        distinct_dates: usize,
        distinct_stations: usize,
    },
    DimensionLoaded {
        dimension: Dimension,
        distinct_keys: usize,
        inserted: usize,
    },
    FactsStarted {
        total_rows: u64,
        already_committed: u64,
        batch_size: usize,
    },
    BatchCommitted {
        /// 1-based index of the batch within this invocation.
        batch_index: u64,
        batch_rows: u64,
        committed_rows: u64,
        remaining_rows: u64,
    },
    Finished {
        committed_rows: u64,
    },
}

/// Receives progress events. Called synchronously on the loading task, so
/// implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &LoadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&LoadProgress) + Send + Sync,
{
    fn on_progress(&self, event: &LoadProgress) {
        self(event)
    }
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, event: &LoadProgress) {
        match event {
            LoadProgress::StageStarted { stage } => debug!(?stage, "Stage started"),
            LoadProgress::SourceScanned {
                rows,
                distinct_dates,
                distinct_stations,
            } => info!(rows, distinct_dates, distinct_stations, "Source file scanned"),
            LoadProgress::DimensionLoaded {
                dimension,
                distinct_keys,
                inserted,
            } => info!(%dimension, distinct_keys, inserted, "Dimension loaded"),
            LoadProgress::FactsStarted {
                total_rows,
                already_committed,
                batch_size,
            } => info!(total_rows, already_committed, batch_size, "Loading fact batches"),
            LoadProgress::BatchCommitted {
                batch_index,
                batch_rows,
                committed_rows,
                remaining_rows,
            } => info!(
                batch_index,
                batch_rows,
                committed_rows,
                remaining_rows,
                "Fact batch committed"
            ),
            LoadProgress::Finished { committed_rows } => {
                info!(committed_rows, "Load finished")
            }
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: &LoadProgress) {}
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn closures_receive_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: &LoadProgress| {
            recorder.lock().unwrap().push(event.clone());
        });

        sink.on_progress(&LoadProgress::StageStarted {
            stage: Stage::Facts,
        });
        sink.on_progress(&LoadProgress::Finished { committed_rows: 3 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], LoadProgress::Finished { committed_rows: 3 });
    }

    #[test]
    fn builtin_sinks_accept_every_event() {
        let event = LoadProgress::BatchCommitted {
            batch_index: 1,
            batch_rows: 10,
            committed_rows: 10,
            remaining_rows: 0,
        };
        NoProgress.on_progress(&event);
        TracingProgress.on_progress(&event);
    }
}
