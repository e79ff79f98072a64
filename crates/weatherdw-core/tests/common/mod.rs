use std::env;
use std::io::{BufWriter, Write};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use tempfile::NamedTempFile;
use weatherdw_core::{db, schema, ConnectionSettings, RetryPolicy};

pub const HEADER: &str = "DAY,MONTH,YEAR,STATIONCODE,STATIONCITY,STATIONCOUNTRY,LATITUDE,LONGITUDE,ELEVATION,PRCP,TAVG,TMAX,TMIN,SNWD,PGTM,SNOW,WDFG,WSFG";

// Every test shares one database, so they take turns.
static DATABASE_LOCK: Mutex<()> = Mutex::new(());

pub struct TestDb {
    pub pool: db::DbPool,
    _guard: MutexGuard<'static, ()>,
}

/// Connect to the test warehouse and empty it, or `None` when no database is configured.
pub async fn test_db(test_name: &str) -> Result<Option<TestDb>> {
    let database_url = match env::var("WEATHERDW_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping {test_name} because WEATHERDW_TEST_DATABASE_URL is not set");
            return Ok(None);
        }
    };

    let guard = DATABASE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let settings = ConnectionSettings {
        database_url: Some(database_url),
        ..ConnectionSettings::default()
    };
    let pool = db::connect(&settings, &RetryPolicy::default()).await?;
    schema::ensure_schema(&pool).await?;
    sqlx::query(
        "TRUNCATE TABLE weather_fact, date_dimension, station_dimension, load_runs RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await?;

    Ok(Some(TestDb {
        pool,
        _guard: guard,
    }))
}

/// A single observation line. `day`/`month`/`year` and `station` vary, the rest is fixed per station.
pub fn line(day: u32, month: u32, year: u32, station: &str, prcp: &str) -> String {
    let (city, country, lat, lon, elev) = match station {
        "ST1" => ("Oslo", "Norway", "59.91", "10.75", "94.0"),
        "ST2" => ("Bergen", "Norway", "60.39", "5.32", "12.0"),
        "ST3" => ("Uppsala", "Sweden", "59.86", "17.64", "24.0"),
        _ => ("Nowhere", "Atlantis", "0.0", "0.0", "0.0"),
    };
    format!(
        "{day},{month},{year},{station},{city},{country},{lat},{lon},{elev},{prcp},1.5,4.0,-2.0,,,0.0,270,11.2"
    )
}

pub fn write_source<I, S>(lines: I) -> Result<NamedTempFile>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(file.as_file());
        writeln!(writer, "{HEADER}")?;
        for l in lines {
            writeln!(writer, "{}", l.as_ref())?;
        }
        writer.flush()?;
    }
    Ok(file)
}

/// `rows` observations cycling through three stations and the days of 2020.
pub fn generated_source(rows: usize) -> Result<NamedTempFile> {
    let stations = ["ST1", "ST2", "ST3"];
    write_source((0..rows).map(|i| {
        let day_of_year = (i / stations.len()) % 365;
        let date = NaiveDate::from_yo_opt(2020, day_of_year as u32 + 1).expect("valid ordinal");
        line(
            date.day(),
            date.month(),
            2020,
            stations[i % stations.len()],
            &format!("{}", (i % 50) as f64 / 10.0),
        )
    }))
}

pub async fn counts(pool: &db::DbPool) -> Result<(i64, i64, i64)> {
    let c = weatherdw_core::queries::warehouse_counts(pool).await?;
    Ok((c.dates, c.stations, c.facts))
}

/// Fact contents expressed through natural keys, in a stable order.
pub async fn fact_contents(
    pool: &db::DbPool,
) -> Result<Vec<(i16, i16, i16, String, Option<f64>, Option<f64>)>> {
    let rows = sqlx::query_as(
        r#"
        SELECT d.year, d.month, d.day, s.station_code, w.prcp, w.snwd
        FROM weather_fact w
        JOIN date_dimension d ON d.date_id = w.date_id
        JOIN station_dimension s ON s.station_id = w.station_id
        ORDER BY d.year, d.month, d.day, s.station_code, w.prcp
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
