//! Fact loading in fixed-size, independently committed batches.

use serde::Serialize;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{LoadError, Result};
use crate::ledger;
use crate::progress::{LoadProgress, ProgressSink};
use crate::registry::{Registries, SurrogateId, Unresolved};
use crate::types::{Measurements, SourceRow};

/// A fact row whose natural keys have been replaced by surrogate ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactRow {
    pub date_id: SurrogateId,
    pub station_id: SurrogateId,
    pub measurements: Measurements,
}

/// Resolve every row of a batch against the registries.
///
/// The first row whose date or station was never registered aborts the batch with
/// [`LoadError::UnresolvedReference`] naming its source line; no row is ever written
/// with a missing foreign key.
pub fn resolve_batch(rows: &[SourceRow], registries: &Registries) -> Result<Vec<FactRow>> {
    rows.iter()
        .map(|row| {
            let unresolved = |source: Unresolved| LoadError::UnresolvedReference {
                line: row.line,
                source,
            };
            Ok(FactRow {
                date_id: registries.dates.resolve(&row.date).map_err(unresolved)?,
                station_id: registries
                    .stations
                    .resolve(row.station_code.as_str())
                    .map_err(unresolved)?,
                measurements: row.measurements,
            })
        })
        .collect()
}

/// Column-oriented copy of a batch, bound as one array per column.
#[derive(Debug, Default)]
struct FactColumns {
    date_ids: Vec<i32>,
    station_ids: Vec<i32>,
    prcp: Vec<Option<f64>>,
    tavg: Vec<Option<f64>>,
    tmax: Vec<Option<f64>>,
    tmin: Vec<Option<f64>>,
    snwd: Vec<Option<f64>>,
    pgtm: Vec<Option<f64>>,
    snow: Vec<Option<f64>>,
    wdfg: Vec<Option<f64>>,
    wsfg: Vec<Option<f64>>,
}

impl FactColumns {
    fn from_rows(rows: &[FactRow]) -> Self {
        let n = rows.len();
        let mut columns = Self {
            date_ids: Vec::with_capacity(n),
            station_ids: Vec::with_capacity(n),
            prcp: Vec::with_capacity(n),
            tavg: Vec::with_capacity(n),
            tmax: Vec::with_capacity(n),
            tmin: Vec::with_capacity(n),
            snwd: Vec::with_capacity(n),
            pgtm: Vec::with_capacity(n),
            snow: Vec::with_capacity(n),
            wdfg: Vec::with_capacity(n),
            wsfg: Vec::with_capacity(n),
        };
        for row in rows {
            let m = &row.measurements;
            columns.date_ids.push(row.date_id);
            columns.station_ids.push(row.station_id);
            columns.prcp.push(m.prcp);
            columns.tavg.push(m.tavg);
            columns.tmax.push(m.tmax);
            columns.tmin.push(m.tmin);
            columns.snwd.push(m.snwd);
            columns.pgtm.push(m.pgtm);
            columns.snow.push(m.snow);
            columns.wdfg.push(m.wdfg);
            columns.wsfg.push(m.wsfg);
        }
        columns
    }
}

/// Insert a resolved batch with a single statement.
///
/// Arrays are unnested server-side, which keeps the bind count at eleven no matter how
/// large the batch is.
pub async fn insert_batch(conn: &mut PgConnection, rows: &[FactRow]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let columns = FactColumns::from_rows(rows);

    let result = sqlx::query(
        r#"
        INSERT INTO weather_fact
            (date_id, station_id, prcp, tavg, tmax, tmin, snwd, pgtm, snow, wdfg, wsfg)
        SELECT * FROM UNNEST(
            $1::int4[], $2::int4[],
            $3::float8[], $4::float8[], $5::float8[], $6::float8[], $7::float8[],
            $8::float8[], $9::float8[], $10::float8[], $11::float8[]
        )
        "#,
    )
    .bind(&columns.date_ids)
    .bind(&columns.station_ids)
    .bind(&columns.prcp)
    .bind(&columns.tavg)
    .bind(&columns.tmax)
    .bind(&columns.tmin)
    .bind(&columns.snwd)
    .bind(&columns.pgtm)
    .bind(&columns.snow)
    .bind(&columns.wdfg)
    .bind(&columns.wsfg)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Parameters of one fact load.
#[derive(Debug, Clone)]
pub struct FactLoadOptions {
    pub batch_size: usize,
    /// Ledger entry whose `committed_rows` advances with every batch.
    pub load_id: Uuid,
    /// Rows already committed by an earlier attempt; that many source rows are skipped.
    pub already_committed: u64,
    pub total_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactLoadSummary {
    pub batches: u64,
    pub rows_inserted: u64,
    pub skipped_rows: u64,
    pub committed_rows: u64,
}

/// Load all fact rows from `rows` in consecutive batches.
///
/// Each batch is resolved, inserted, and committed together with the ledger's
/// high-water mark in one transaction, so a batch is either fully persisted and
/// counted or absent. Cancellation is checked between batches; an in-flight batch
/// always runs to its commit.
pub async fn load_facts<I>(
    pool: &DbPool,
    rows: I,
    registries: &Registries,
    options: &FactLoadOptions,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<FactLoadSummary>
where
    I: IntoIterator<Item = Result<SourceRow>>,
{
    let mut rows = rows.into_iter();
    let mut summary = FactLoadSummary {
        batches: 0,
        rows_inserted: 0,
        skipped_rows: 0,
        committed_rows: options.already_committed,
    };

    for skipped in rows.by_ref().take(options.already_committed as usize) {
        skipped?;
        summary.skipped_rows += 1;
    }

    progress.on_progress(&LoadProgress::FactsStarted {
        total_rows: options.total_rows,
        already_committed: options.already_committed,
        batch_size: options.batch_size,
    });

    loop {
        let batch: Vec<SourceRow> = rows
            .by_ref()
            .take(options.batch_size)
            .collect::<Result<_>>()?;
        if batch.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled {
                committed_rows: summary.committed_rows,
            });
        }

        let resolved = resolve_batch(&batch, registries)?;

        let mut tx = pool.begin().await?;
        let inserted = insert_batch(&mut *tx, &resolved).await?;
        let committed = summary.committed_rows + inserted;
        ledger::record_progress(&mut *tx, options.load_id, committed).await?;
        tx.commit().await?;

        summary.batches += 1;
        summary.rows_inserted += inserted;
        summary.committed_rows = committed;
        debug!(
            batch = summary.batches,
            first_line = batch[0].line,
            rows = inserted,
            "Fact batch committed"
        );

        progress.on_progress(&LoadProgress::BatchCommitted {
            batch_index: summary.batches,
            batch_rows: inserted,
            committed_rows: committed,
            remaining_rows: options.total_rows.saturating_sub(committed),
        });
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DateKey, StationAttributes};

    fn source_row(line: u64, day: i16, code: &str, prcp: Option<f64>) -> SourceRow {
        SourceRow {
            line,
            date: DateKey::new(day, 1, 2020),
            station_code: code.to_string(),
            station: StationAttributes {
                station_city: "Oslo".into(),
                station_country: "Norway".into(),
                latitude: 59.9,
                longitude: 10.7,
                elevation: 94.0,
            },
            measurements: Measurements {
                prcp,
                ..Measurements::default()
            },
        }
    }

    fn registries() -> Registries {
        let mut registries = Registries::new();
        registries.dates.register(DateKey::new(1, 1, 2020), 10).unwrap();
        registries.stations.register("ST1".into(), 100).unwrap();
        registries.stations.register("ST2".into(), 200).unwrap();
        registries
    }

    #[test]
    fn rows_resolve_to_surrogate_ids() {
        let rows = vec![
            source_row(2, 1, "ST1", Some(2.5)),
            source_row(3, 1, "ST2", Some(0.0)),
        ];
        let resolved = resolve_batch(&rows, &registries()).unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!((resolved[0].date_id, resolved[0].station_id), (10, 100));
        assert_eq!((resolved[1].date_id, resolved[1].station_id), (10, 200));
        assert_eq!(resolved[0].measurements.prcp, Some(2.5));
    }

    #[test]
    fn unknown_date_reports_offending_line_and_key() {
        let rows = vec![
            source_row(2, 1, "ST1", None),
            source_row(3, 2, "ST1", None),
        ];
        let err = resolve_batch(&rows, &registries()).unwrap_err();
        match err {
            LoadError::UnresolvedReference { line, source } => {
                assert_eq!(line, 3);
                assert_eq!(source.dimension, crate::types::Dimension::Date);
                assert_eq!(source.key, "2020-01-02");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_station_is_unresolved() {
        let rows = vec![source_row(7, 1, "ST9", None)];
        let err = resolve_batch(&rows, &registries()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "source line 7: no station surrogate registered for natural key ST9"
        );
    }

    #[test]
    fn empty_registries_reject_every_row() {
        let rows = vec![source_row(2, 1, "ST1", None)];
        assert!(resolve_batch(&rows, &Registries::new()).is_err());
        assert!(resolve_batch(&[], &Registries::new()).unwrap().is_empty());
    }

    #[test]
    fn columns_preserve_row_order_and_nulls() {
        let resolved = resolve_batch(
            &[
                source_row(2, 1, "ST2", None),
                source_row(3, 1, "ST1", Some(1.25)),
            ],
            &registries(),
        )
        .unwrap();
        let columns = FactColumns::from_rows(&resolved);
        assert_eq!(columns.station_ids, vec![200, 100]);
        assert_eq!(columns.prcp, vec![None, Some(1.25)]);
        assert_eq!(columns.wsfg, vec![None, None]);
    }
}
