use std::fmt;

use serde::Serialize;

/// The two dimension tables of the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Date,
    Station,
}

impl Dimension {
    pub fn table(&self) -> &'static str {
        match self {
            Dimension::Date => "date_dimension",
            Dimension::Station => "station_dimension",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Date => f.write_str("date"),
            Dimension::Station => f.write_str("station"),
        }
    }
}

/// Natural key of the date dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DateKey {
    pub year: i16,
    pub month: i16,
    pub day: i16,
}

impl DateKey {
    pub fn new(day: i16, month: i16, year: i16) -> Self {
        Self { year, month, day }
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Descriptive attributes of a station, everything except its code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationAttributes {
    pub station_city: String,
    pub station_country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

/// The nine measurement columns of a weather observation. Any may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Measurements {
    pub prcp: Option<f64>,
    pub tavg: Option<f64>,
    pub tmax: Option<f64>,
    pub tmin: Option<f64>,
    pub snwd: Option<f64>,
    pub pgtm: Option<f64>,
    pub snow: Option<f64>,
    pub wdfg: Option<f64>,
    pub wsfg: Option<f64>,
}

/// One parsed line of the denormalized source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based line number in the source file, header included.
    pub line: u64,
    pub date: DateKey,
    pub station_code: String,
    pub station: StationAttributes,
    pub measurements: Measurements,
}
