//! Read-only queries against the star schema.
//!
//! These are the warehouse's contract with its reporting consumers: aggregates of one
//! measurement per station, filtered by year and month range and optionally by country.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::{Postgres, Row};

use crate::db::DbPool;
use crate::error::{LoadError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Measure {
    Prcp,
    Tavg,
    Tmax,
    Tmin,
    Snwd,
    Pgtm,
    Snow,
    Wdfg,
    Wsfg,
}

impl Measure {
    pub const ALL: [Measure; 9] = [
        Measure::Prcp,
        Measure::Tavg,
        Measure::Tmax,
        Measure::Tmin,
        Measure::Snwd,
        Measure::Pgtm,
        Measure::Snow,
        Measure::Wdfg,
        Measure::Wsfg,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Measure::Prcp => "prcp",
            Measure::Tavg => "tavg",
            Measure::Tmax => "tmax",
            Measure::Tmin => "tmin",
            Measure::Snwd => "snwd",
            Measure::Pgtm => "pgtm",
            Measure::Snow => "snow",
            Measure::Wdfg => "wdfg",
            Measure::Wsfg => "wsfg",
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for Measure {
    type Err = LoadError;

    fn from_str(value: &str) -> Result<Self> {
        let lower = value.to_ascii_lowercase();
        Measure::ALL
            .into_iter()
            .find(|m| m.column() == lower)
            .ok_or_else(|| LoadError::Config(format!("unknown measure {value:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Avg,
    Min,
    Max,
}

impl Statistic {
    fn sql_function(&self) -> &'static str {
        match self {
            Statistic::Avg => "AVG",
            Statistic::Min => "MIN",
            Statistic::Max => "MAX",
        }
    }
}

impl FromStr for Statistic {
    type Err = LoadError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(Statistic::Avg),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            _ => Err(LoadError::Config(format!("unknown statistic {value:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub measure: Measure,
    pub statistic: Statistic,
    pub from_year: i16,
    pub to_year: i16,
    pub from_month: i16,
    pub to_month: i16,
    pub country: Option<String>,
}

impl AggregateQuery {
    pub fn new(measure: Measure, statistic: Statistic, from_year: i16, to_year: i16) -> Self {
        Self {
            measure,
            statistic,
            from_year,
            to_year,
            from_month: 1,
            to_month: 12,
            country: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from_year > self.to_year {
            return Err(LoadError::Config(format!(
                "year range {}..={} is empty",
                self.from_year, self.to_year
            )));
        }
        let months = 1..=12;
        if !months.contains(&self.from_month)
            || !months.contains(&self.to_month)
            || self.from_month > self.to_month
        {
            return Err(LoadError::Config(format!(
                "month range {}..={} is invalid",
                self.from_month, self.to_month
            )));
        }
        Ok(())
    }

    fn station_sql(&self) -> String {
        // Only enum-derived identifiers are interpolated; every filter is a bind parameter.
        format!(
            r#"
            SELECT s.station_code, s.station_city, s.station_country,
                   s.latitude, s.longitude,
                   {function}(w.{column}) AS value,
                   COUNT(w.{column}) AS observations
            {FILTERED_FACTS}
            GROUP BY s.station_id, s.station_code, s.station_city, s.station_country,
                     s.latitude, s.longitude
            ORDER BY s.station_code
            "#,
            function = self.statistic.sql_function(),
            column = self.measure.column(),
        )
    }

    fn city_sql(&self) -> String {
        format!(
            r#"
            SELECT s.station_city, s.station_country,
                   COUNT(DISTINCT s.station_id) AS stations,
                   {function}(w.{column}) AS value,
                   COUNT(w.{column}) AS observations
            {FILTERED_FACTS}
            GROUP BY s.station_city, s.station_country
            ORDER BY s.station_country, s.station_city
            "#,
            function = self.statistic.sql_function(),
            column = self.measure.column(),
        )
    }
}

const FILTERED_FACTS: &str = r#"
            FROM weather_fact w
            JOIN station_dimension s ON s.station_id = w.station_id
            JOIN date_dimension d ON d.date_id = w.date_id
            WHERE d.year BETWEEN $1 AND $2
              AND d.month BETWEEN $3 AND $4
              AND ($5::text IS NULL OR s.station_country = $5)"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationAggregate {
    pub station_code: String,
    pub station_city: String,
    pub station_country: String,
    pub latitude: f64,
    pub longitude: f64,
    /// `None` when every observation of the measure in range was null.
    pub value: Option<f64>,
    pub observations: i64,
}

pub async fn station_aggregates(
    pool: &DbPool,
    query: &AggregateQuery,
) -> Result<Vec<StationAggregate>> {
    query.validate()?;

    let rows = bind_filters(sqlx::query(&query.station_sql()), query)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(StationAggregate {
                station_code: row.try_get("station_code")?,
                station_city: row.try_get("station_city")?,
                station_country: row.try_get("station_country")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                value: row.try_get("value")?,
                observations: row.try_get("observations")?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityAggregate {
    pub station_city: String,
    pub station_country: String,
    pub stations: i64,
    pub value: Option<f64>,
    pub observations: i64,
}

/// Same filters as [`station_aggregates`], grouped by city and country instead.
pub async fn city_aggregates(pool: &DbPool, query: &AggregateQuery) -> Result<Vec<CityAggregate>> {
    query.validate()?;

    let rows = bind_filters(sqlx::query(&query.city_sql()), query)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(CityAggregate {
                station_city: row.try_get("station_city")?,
                station_country: row.try_get("station_country")?,
                stations: row.try_get("stations")?,
                value: row.try_get("value")?,
                observations: row.try_get("observations")?,
            })
        })
        .collect()
}

fn bind_filters<'q>(
    sql: sqlx::query::Query<'q, Postgres, PgArguments>,
    query: &'q AggregateQuery,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    sql.bind(query.from_year)
        .bind(query.to_year)
        .bind(query.from_month)
        .bind(query.to_month)
        .bind(query.country.as_deref())
}

pub async fn available_years(pool: &DbPool) -> Result<Vec<i16>> {
    let years = sqlx::query_scalar::<_, i16>("SELECT DISTINCT year FROM date_dimension ORDER BY year")
        .fetch_all(pool)
        .await?;
    Ok(years)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarehouseCounts {
    pub dates: i64,
    pub stations: i64,
    pub facts: i64,
}

pub async fn warehouse_counts(pool: &DbPool) -> Result<WarehouseCounts> {
    let (dates, stations, facts): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM date_dimension),
            (SELECT COUNT(*) FROM station_dimension),
            (SELECT COUNT(*) FROM weather_fact)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(WarehouseCounts {
        dates,
        stations,
        facts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_parse_case_insensitively() {
        assert_eq!("PRCP".parse::<Measure>().unwrap(), Measure::Prcp);
        assert_eq!("wsfg".parse::<Measure>().unwrap(), Measure::Wsfg);
        assert!("humidity".parse::<Measure>().is_err());
    }

    #[test]
    fn statistics_parse() {
        assert_eq!("AVG".parse::<Statistic>().unwrap(), Statistic::Avg);
        assert_eq!("mean".parse::<Statistic>().unwrap(), Statistic::Avg);
        assert_eq!("max".parse::<Statistic>().unwrap(), Statistic::Max);
        assert!("median".parse::<Statistic>().is_err());
    }

    #[test]
    fn sql_interpolates_only_the_chosen_column_and_function() {
        let query = AggregateQuery::new(Measure::Tmin, Statistic::Min, 2000, 2020);
        let sql = query.station_sql();
        assert!(sql.contains("MIN(w.tmin) AS value"));
        assert!(sql.contains("COUNT(w.tmin)"));
        assert!(sql.contains("d.year BETWEEN $1 AND $2"));

        let by_city = AggregateQuery::new(Measure::Wsfg, Statistic::Max, 2000, 2020).city_sql();
        assert!(by_city.contains("MAX(w.wsfg) AS value"));
        assert!(by_city.contains("GROUP BY s.station_city, s.station_country"));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut query = AggregateQuery::new(Measure::Prcp, Statistic::Avg, 2020, 2010);
        assert!(query.validate().is_err());

        query.to_year = 2020;
        query.from_month = 6;
        query.to_month = 3;
        assert!(query.validate().is_err());

        query.to_month = 13;
        query.from_month = 1;
        assert!(query.validate().is_err());

        query.to_month = 12;
        assert!(query.validate().is_ok());
    }
}
