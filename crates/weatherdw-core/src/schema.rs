//! Warehouse DDL: two dimensions, one fact table and the load-run ledger.
//!
//! Every statement is guarded with `IF NOT EXISTS`, so provisioning an already
//! provisioned warehouse is a no-op. Because `IF NOT EXISTS` silently accepts a
//! pre-existing table of a different shape, the column layout is verified afterwards.

use std::collections::HashMap;

use sqlx::Row;
use tracing::info;

use crate::db::DbPool;
use crate::error::{LoadError, Result};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS date_dimension (
        date_id INTEGER GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
        day SMALLINT NOT NULL CHECK (day BETWEEN 1 AND 31),
        month SMALLINT NOT NULL CHECK (month BETWEEN 1 AND 12),
        year SMALLINT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS date_dimension_natural_key
        ON date_dimension (day, month, year)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS station_dimension (
        station_id INTEGER GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
        station_code TEXT NOT NULL,
        station_city TEXT NOT NULL,
        station_country TEXT NOT NULL,
        latitude DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL,
        elevation DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS station_dimension_natural_key
        ON station_dimension (station_code)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS weather_fact (
        weather_id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
        date_id INTEGER NOT NULL REFERENCES date_dimension (date_id),
        station_id INTEGER NOT NULL REFERENCES station_dimension (station_id),
        prcp DOUBLE PRECISION,
        tavg DOUBLE PRECISION,
        tmax DOUBLE PRECISION,
        tmin DOUBLE PRECISION,
        snwd DOUBLE PRECISION,
        pgtm DOUBLE PRECISION,
        snow DOUBLE PRECISION,
        wdfg DOUBLE PRECISION,
        wsfg DOUBLE PRECISION
    )
    "#,
    "CREATE INDEX IF NOT EXISTS weather_fact_date_id ON weather_fact (date_id)",
    "CREATE INDEX IF NOT EXISTS weather_fact_station_id ON weather_fact (station_id)",
    r#"
    CREATE TABLE IF NOT EXISTS load_runs (
        load_id UUID PRIMARY KEY,
        source_hash TEXT NOT NULL,
        source_path TEXT NOT NULL,
        total_rows BIGINT NOT NULL,
        committed_rows BIGINT NOT NULL DEFAULT 0,
        batch_size INTEGER NOT NULL,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS load_runs_source_hash ON load_runs (source_hash)",
];

/// Expected `(column, information_schema data_type)` pairs per table.
const EXPECTED_COLUMNS: &[(&str, &[(&str, &str)])] = &[
    (
        "date_dimension",
        &[
            ("date_id", "integer"),
            ("day", "smallint"),
            ("month", "smallint"),
            ("year", "smallint"),
        ],
    ),
    (
        "station_dimension",
        &[
            ("station_id", "integer"),
            ("station_code", "text"),
            ("station_city", "text"),
            ("station_country", "text"),
            ("latitude", "double precision"),
            ("longitude", "double precision"),
            ("elevation", "double precision"),
        ],
    ),
    (
        "weather_fact",
        &[
            ("weather_id", "bigint"),
            ("date_id", "integer"),
            ("station_id", "integer"),
            ("prcp", "double precision"),
            ("tavg", "double precision"),
            ("tmax", "double precision"),
            ("tmin", "double precision"),
            ("snwd", "double precision"),
            ("pgtm", "double precision"),
            ("snow", "double precision"),
            ("wdfg", "double precision"),
            ("wsfg", "double precision"),
        ],
    ),
    (
        "load_runs",
        &[
            ("load_id", "uuid"),
            ("source_hash", "text"),
            ("total_rows", "bigint"),
            ("committed_rows", "bigint"),
            ("status", "text"),
        ],
    ),
];

/// Create the warehouse tables if absent and check that existing ones match.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|err| classify_ddl_error(statement, err))?;
    }
    tx.commit().await?;

    verify_schema(pool).await?;
    info!("Warehouse schema provisioned");
    Ok(())
}

/// Compare the live column layout against the expected one.
pub async fn verify_schema(pool: &DbPool) -> Result<()> {
    for (table, expected) in EXPECTED_COLUMNS {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(*table)
        .fetch_all(pool)
        .await?;

        let mut actual = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            actual.insert(name, data_type);
        }

        check_columns(table, expected, &actual)?;
    }
    Ok(())
}

fn check_columns(
    table: &str,
    expected: &[(&str, &str)],
    actual: &HashMap<String, String>,
) -> Result<()> {
    for (column, data_type) in expected {
        match actual.get(*column) {
            None => {
                return Err(LoadError::SchemaConflict {
                    table: table.to_string(),
                    reason: format!("missing column {column}"),
                })
            }
            Some(found) if found != data_type => {
                return Err(LoadError::SchemaConflict {
                    table: table.to_string(),
                    reason: format!("column {column} has type {found}, expected {data_type}"),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// The table a DDL statement acts on. For `CREATE INDEX … ON t` that is `t`, not the index.
fn ddl_target(statement: &str) -> &str {
    let mut words = statement.split_whitespace();
    let is_index = statement.split_whitespace().any(|word| word == "INDEX");
    let marker = if is_index { "ON" } else { "EXISTS" };
    words
        .find(|word| *word == marker)
        .and_then(|_| words.next())
        .unwrap_or("warehouse")
}

fn classify_ddl_error(statement: &str, err: sqlx::Error) -> LoadError {
    let table = ddl_target(statement).to_string();

    // 23505: a unique index cannot be built over rows that already repeat a natural key.
    // 42P07 / 42710 / 42809: an object of the same name but a different kind exists.
    let conflict = match &err {
        sqlx::Error::Database(db_err)
            if matches!(
                db_err.code().as_deref(),
                Some("23505") | Some("42P07") | Some("42710") | Some("42809")
            ) =>
        {
            Some(db_err.message().to_string())
        }
        _ => None,
    };

    match conflict {
        Some(reason) => LoadError::SchemaConflict { table, reason },
        None => LoadError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn matching_layout_passes() {
        let (table, expected) = EXPECTED_COLUMNS[0];
        let mut actual = columns(expected);
        actual.insert("extra".into(), "text".into());
        assert!(check_columns(table, expected, &actual).is_ok());
    }

    #[test]
    fn missing_column_is_a_conflict() {
        let (table, expected) = EXPECTED_COLUMNS[1];
        let actual = columns(&expected[..3]);
        let err = check_columns(table, expected, &actual).unwrap_err();
        match err {
            LoadError::SchemaConflict { table, reason } => {
                assert_eq!(table, "station_dimension");
                assert!(reason.contains("station_country"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mistyped_column_is_a_conflict() {
        let (table, expected) = EXPECTED_COLUMNS[0];
        let mut actual = columns(expected);
        actual.insert("year".into(), "integer".into());
        let err = check_columns(table, expected, &actual).unwrap_err();
        assert!(err.to_string().contains("year has type integer"));
    }

    #[test]
    fn conflicts_name_the_table_not_the_index() {
        assert_eq!(ddl_target(SCHEMA_STATEMENTS[0]), "date_dimension");
        assert_eq!(ddl_target(SCHEMA_STATEMENTS[1]), "date_dimension");
        assert_eq!(ddl_target(SCHEMA_STATEMENTS[3]), "station_dimension");
        assert_eq!(
            ddl_target("CREATE INDEX IF NOT EXISTS weather_fact_date_id ON weather_fact (date_id)"),
            "weather_fact"
        );

        let err = classify_ddl_error(SCHEMA_STATEMENTS[1], sqlx::Error::RowNotFound);
        assert!(matches!(err, LoadError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn every_statement_is_guarded() {
        for statement in SCHEMA_STATEMENTS {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "unguarded DDL: {statement}"
            );
        }
    }
}
