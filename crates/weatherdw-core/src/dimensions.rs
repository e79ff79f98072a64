//! Dimension loading: deduplicate source rows by natural key, upsert one row per key,
//! and register the warehouse-generated surrogate id.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgConnection, Row};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::DbPool;
use crate::error::{LoadError, Result};
use crate::registry::{SurrogateId, SurrogateKeyRegistry};
use crate::types::{DateKey, Dimension, SourceRow, StationAttributes};

/// Result of writing a single natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<A> {
    pub id: SurrogateId,
    /// Attributes as stored in the warehouse, which differ from the source when the
    /// key already existed with other values.
    pub stored: A,
    pub inserted: bool,
}

/// How a dimension is projected out of a source row and written to its table.
#[async_trait]
pub trait DimensionProjection: Send + Sync + 'static {
    type Key: Clone + Ord + Hash + Display + Send + Sync;
    type Attributes: Clone + PartialEq + Debug + Send + Sync;

    const DIMENSION: Dimension;

    fn project(row: &SourceRow) -> (Self::Key, Self::Attributes);

    /// Insert the key, or return the existing row's id and attributes if it is present.
    async fn upsert(
        conn: &mut PgConnection,
        key: &Self::Key,
        attributes: &Self::Attributes,
    ) -> Result<Upserted<Self::Attributes>>;
}

#[derive(Debug)]
pub struct DateProjection;

#[async_trait]
impl DimensionProjection for DateProjection {
    type Key = DateKey;
    type Attributes = ();

    const DIMENSION: Dimension = Dimension::Date;

    fn project(row: &SourceRow) -> (DateKey, ()) {
        (row.date, ())
    }

    async fn upsert(conn: &mut PgConnection, key: &DateKey, _: &()) -> Result<Upserted<()>> {
        let row = sqlx::query(
            r#"
            INSERT INTO date_dimension (day, month, year)
            VALUES ($1, $2, $3)
            ON CONFLICT (day, month, year)
            DO UPDATE SET day = EXCLUDED.day
            RETURNING date_id, (xmax = 0) AS inserted
            "#,
        )
        .bind(key.day)
        .bind(key.month)
        .bind(key.year)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Upserted {
            id: row.try_get("date_id")?,
            stored: (),
            inserted: row.try_get("inserted")?,
        })
    }
}

#[derive(Debug)]
pub struct StationProjection;

#[async_trait]
impl DimensionProjection for StationProjection {
    type Key = String;
    type Attributes = StationAttributes;

    const DIMENSION: Dimension = Dimension::Station;

    fn project(row: &SourceRow) -> (String, StationAttributes) {
        (row.station_code.clone(), row.station.clone())
    }

    async fn upsert(
        conn: &mut PgConnection,
        key: &String,
        attributes: &StationAttributes,
    ) -> Result<Upserted<StationAttributes>> {
        // The no-op update only exists so RETURNING also yields the existing row;
        // stored attributes are never overwritten.
        let row = sqlx::query(
            r#"
            INSERT INTO station_dimension
                (station_code, station_city, station_country, latitude, longitude, elevation)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (station_code)
            DO UPDATE SET station_code = EXCLUDED.station_code
            RETURNING station_id, station_city, station_country, latitude, longitude, elevation,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(key)
        .bind(&attributes.station_city)
        .bind(&attributes.station_country)
        .bind(attributes.latitude)
        .bind(attributes.longitude)
        .bind(attributes.elevation)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Upserted {
            id: row.try_get("station_id")?,
            stored: StationAttributes {
                station_city: row.try_get("station_city")?,
                station_country: row.try_get("station_country")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                elevation: row.try_get("elevation")?,
            },
            inserted: row.try_get("inserted")?,
        })
    }
}

/// The distinct natural keys of one dimension, with their attributes.
///
/// The same key seen with different attributes is a data-quality failure
/// ([`LoadError::AttributeConflict`]); the first occurrence is never silently preferred.
pub struct DistinctKeys<D: DimensionProjection> {
    entries: BTreeMap<D::Key, (D::Attributes, u64)>,
}

impl<D: DimensionProjection> Default for DistinctKeys<D> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<D: DimensionProjection> DistinctKeys<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, row: &SourceRow) -> Result<()> {
        let (key, attributes) = D::project(row);
        match self.entries.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert((attributes, row.line));
            }
            Entry::Occupied(entry) => {
                let (first, first_line) = entry.get();
                if *first != attributes {
                    return Err(LoadError::AttributeConflict {
                        dimension: D::DIMENSION,
                        key: entry.key().to_string(),
                        reason: format!(
                            "line {} has {:?} but line {} has {:?}",
                            first_line, first, row.line, attributes
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&D::Key, &D::Attributes)> {
        self.entries.iter().map(|(key, (attributes, _))| (key, attributes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionLoadSummary {
    pub dimension: Dimension,
    pub distinct_keys: usize,
    pub inserted: usize,
    pub existing: usize,
}

/// Write every distinct key of one dimension and register its surrogate id.
///
/// The whole dimension is written in one transaction. Any failure rolls it back, so a
/// dimension is never left partially populated. Cancellation is checked before each key
/// and yields [`LoadError::Cancelled`] with no fact rows committed by this call.
pub async fn load_dimension<D: DimensionProjection>(
    pool: &DbPool,
    keys: &DistinctKeys<D>,
    registry: &mut SurrogateKeyRegistry<D::Key>,
    cancel: &CancellationToken,
) -> Result<DimensionLoadSummary> {
    let mut summary = DimensionLoadSummary {
        dimension: D::DIMENSION,
        distinct_keys: keys.len(),
        inserted: 0,
        existing: 0,
    };

    let mut tx = pool.begin().await?;
    for (key, attributes) in keys.iter() {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled { committed_rows: 0 });
        }
        let upserted = D::upsert(&mut *tx, key, attributes).await?;
        if upserted.stored != *attributes {
            return Err(LoadError::AttributeConflict {
                dimension: D::DIMENSION,
                key: key.to_string(),
                reason: format!(
                    "warehouse holds {:?} but the source has {:?}",
                    upserted.stored, attributes
                ),
            });
        }
        registry.register(key.clone(), upserted.id)?;

        if upserted.inserted {
            summary.inserted += 1;
        } else {
            summary.existing += 1;
        }
    }
    tx.commit().await?;

    info!(
        dimension = %D::DIMENSION,
        distinct = summary.distinct_keys,
        inserted = summary.inserted,
        existing = summary.existing,
        "Dimension load committed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Measurements;

    fn row(line: u64, day: i16, code: &str, city: &str) -> SourceRow {
        SourceRow {
            line,
            date: DateKey::new(day, 1, 2020),
            station_code: code.to_string(),
            station: StationAttributes {
                station_city: city.to_string(),
                station_country: "Norway".to_string(),
                latitude: 59.9,
                longitude: 10.7,
                elevation: 94.0,
            },
            measurements: Measurements::default(),
        }
    }

    #[test]
    fn dates_are_deduplicated_regardless_of_order() {
        let mut dates = DistinctKeys::<DateProjection>::new();
        for r in [row(2, 2, "A", "x"), row(3, 1, "B", "y"), row(4, 2, "C", "z")] {
            dates.observe(&r).unwrap();
        }
        let keys: Vec<DateKey> = dates.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![DateKey::new(1, 1, 2020), DateKey::new(2, 1, 2020)]);
    }

    #[test]
    fn stations_are_keyed_by_code_only() {
        let mut stations = DistinctKeys::<StationProjection>::new();
        stations.observe(&row(2, 1, "ST1", "Oslo")).unwrap();
        stations.observe(&row(3, 2, "ST1", "Oslo")).unwrap();
        stations.observe(&row(4, 1, "ST2", "Bergen")).unwrap();
        assert_eq!(stations.len(), 2);
    }

    #[test]
    fn same_station_code_with_other_city_is_a_conflict() {
        let mut stations = DistinctKeys::<StationProjection>::new();
        stations.observe(&row(2, 1, "ST1", "Oslo")).unwrap();
        let err = stations.observe(&row(9, 1, "ST1", "Bergen")).unwrap_err();
        match err {
            LoadError::AttributeConflict {
                dimension,
                key,
                reason,
            } => {
                assert_eq!(dimension, Dimension::Station);
                assert_eq!(key, "ST1");
                assert!(reason.contains("line 2"), "{reason}");
                assert!(reason.contains("line 9"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
