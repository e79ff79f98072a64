//! Streaming reader for the denormalized observation file.
//!
//! The file is read twice per load (once for dimensions, once for facts), so rows are
//! yielded one at a time rather than collected. Malformed values fail fast with the
//! offending line and column instead of turning into nulls.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};

use crate::error::{LoadError, Result};
use crate::types::{DateKey, Measurements, SourceRow, StationAttributes};

pub const DATE_COLUMNS: [&str; 3] = ["DAY", "MONTH", "YEAR"];
pub const STATION_COLUMNS: [&str; 6] = [
    "STATIONCODE",
    "STATIONCITY",
    "STATIONCOUNTRY",
    "LATITUDE",
    "LONGITUDE",
    "ELEVATION",
];
pub const MEASUREMENT_COLUMNS: [&str; 9] = [
    "PRCP", "TAVG", "TMAX", "TMIN", "SNWD", "PGTM", "SNOW", "WDFG", "WSFG",
];

/// Spellings of a missing measurement, as written by common exporters.
const NULL_MARKERS: [&str; 5] = ["", "NaN", "nan", "NA", "null"];

/// A source file on disk together with its delimiter.
#[derive(Debug, Clone)]
pub struct SourceFile {
    path: PathBuf,
    delimiter: u8,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, delimiter: u8) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content hash identifying this file in the load-run ledger.
    pub fn fingerprint(&self) -> Result<String> {
        let mut file = File::open(&self.path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Open a fresh pass over the file's rows.
    pub fn rows(&self) -> Result<SourceRows<BufReader<File>>> {
        let file = File::open(&self.path)?;
        SourceRows::from_reader(BufReader::new(file), self.delimiter)
    }
}

/// Positions of the required columns within the header.
#[derive(Debug, Clone)]
struct ColumnIndex {
    date: [usize; 3],
    station: [usize; 6],
    measurements: [usize; 9],
}

impl ColumnIndex {
    fn from_header(header: &StringRecord) -> Result<Self> {
        let find = |name: &str| -> Result<usize> {
            header
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| {
                    LoadError::malformed(1, name, "required column is missing from the header")
                })
        };

        let mut date = [0; 3];
        for (slot, name) in date.iter_mut().zip(DATE_COLUMNS) {
            *slot = find(name)?;
        }
        let mut station = [0; 6];
        for (slot, name) in station.iter_mut().zip(STATION_COLUMNS) {
            *slot = find(name)?;
        }
        let mut measurements = [0; 9];
        for (slot, name) in measurements.iter_mut().zip(MEASUREMENT_COLUMNS) {
            *slot = find(name)?;
        }

        Ok(Self {
            date,
            station,
            measurements,
        })
    }
}

/// Iterator over the parsed rows of one pass.
pub struct SourceRows<R: Read> {
    reader: csv::Reader<R>,
    header: StringRecord,
    columns: ColumnIndex,
    record: StringRecord,
}

impl<R: Read> SourceRows<R> {
    pub fn from_reader(reader: R, delimiter: u8) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);
        let header = reader.headers()?.clone();
        let columns = ColumnIndex::from_header(&header)?;

        Ok(Self {
            reader,
            header,
            columns,
            record: StringRecord::new(),
        })
    }

    fn parse_current(&self) -> Result<SourceRow> {
        let record = &self.record;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        self.check_width(line)?;
        let field = |index: usize| record.get(index).unwrap_or("");
        let columns = &self.columns;

        let [day_at, month_at, year_at] = columns.date;
        let day = parse_small_int(field(day_at), line, DATE_COLUMNS[0])?;
        let month = parse_small_int(field(month_at), line, DATE_COLUMNS[1])?;
        let year = parse_small_int(field(year_at), line, DATE_COLUMNS[2])?;
        let is_calendar_date = day >= 1
            && month >= 1
            && NaiveDate::from_ymd_opt(year.into(), month as u32, day as u32).is_some();
        if !is_calendar_date {
            return Err(LoadError::malformed(
                line,
                "DAY",
                format!("{year:04}-{month:02}-{day:02} is not a calendar date"),
            ));
        }

        let [code_at, city_at, country_at, lat_at, lon_at, elev_at] = columns.station;
        let station_code = field(code_at);
        if station_code.is_empty() {
            return Err(LoadError::malformed(line, STATION_COLUMNS[0], "missing value"));
        }
        let station = StationAttributes {
            station_city: field(city_at).to_string(),
            station_country: field(country_at).to_string(),
            latitude: parse_required_f64(field(lat_at), line, STATION_COLUMNS[3])?,
            longitude: parse_required_f64(field(lon_at), line, STATION_COLUMNS[4])?,
            elevation: parse_required_f64(field(elev_at), line, STATION_COLUMNS[5])?,
        };

        let m = |i: usize| {
            parse_measurement(field(columns.measurements[i]), line, MEASUREMENT_COLUMNS[i])
        };
        let measurements = Measurements {
            prcp: m(0)?,
            tavg: m(1)?,
            tmax: m(2)?,
            tmin: m(3)?,
            snwd: m(4)?,
            pgtm: m(5)?,
            snow: m(6)?,
            wdfg: m(7)?,
            wsfg: m(8)?,
        };

        Ok(SourceRow {
            line,
            date: DateKey::new(day, month, year),
            station_code: station_code.to_string(),
            station,
            measurements,
        })
    }
}

impl<R: Read> SourceRows<R> {
    /// A row must carry exactly one field per header column.
    fn check_width(&self, line: u64) -> Result<()> {
        let expected = self.header.len();
        let found = self.record.len();
        if found == expected {
            return Ok(());
        }
        let column = self
            .header
            .get(found.min(expected.saturating_sub(1)))
            .unwrap_or_default();
        Err(LoadError::malformed(
            line,
            column,
            format!("expected {expected} fields, found {found}"),
        ))
    }
}

impl<R: Read> Iterator for SourceRows<R> {
    type Item = Result<SourceRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(true) => Some(self.parse_current()),
            Ok(false) => None,
            Err(err) => Some(Err(err.into())),
        }
    }
}

/// Integers may arrive as `"3"` or `"3.0"`; the latter is what a float-typed column export writes.
fn parse_small_int(raw: &str, line: u64, column: &str) -> Result<i16> {
    if raw.is_empty() {
        return Err(LoadError::malformed(line, column, "missing value"));
    }
    if let Ok(value) = raw.parse::<i16>() {
        return Ok(value);
    }
    match raw.parse::<f64>() {
        Ok(value)
            if value.fract() == 0.0 && value >= i16::MIN as f64 && value <= i16::MAX as f64 =>
        {
            Ok(value as i16)
        }
        _ => Err(LoadError::malformed(
            line,
            column,
            format!("expected an integer, found {raw:?}"),
        )),
    }
}

fn parse_required_f64(raw: &str, line: u64, column: &str) -> Result<f64> {
    match parse_measurement(raw, line, column)? {
        Some(value) => Ok(value),
        None => Err(LoadError::malformed(line, column, "missing value")),
    }
}

fn parse_measurement(raw: &str, line: u64, column: &str) -> Result<Option<f64>> {
    if NULL_MARKERS.contains(&raw) {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(LoadError::malformed(
            line,
            column,
            format!("expected a number, found {raw:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const HEADER: &str = "DAY,MONTH,YEAR,STATIONCODE,STATIONCITY,STATIONCOUNTRY,LATITUDE,LONGITUDE,ELEVATION,PRCP,TAVG,TMAX,TMIN,SNWD,PGTM,SNOW,WDFG,WSFG";

    fn parse(body: &str) -> Vec<Result<SourceRow>> {
        let text = format!("{HEADER}\n{body}");
        SourceRows::from_reader(text.as_bytes(), b',')
            .unwrap()
            .collect()
    }

    #[test]
    fn parses_a_complete_row() {
        let rows = parse("1,1,2020,ST1,Oslo,Norway,59.9,10.7,94,2.5,1.0,3.5,-1.5,,,0,270,12.5\n");
        let row = rows.into_iter().next().unwrap().unwrap();

        assert_eq!(row.line, 2);
        assert_eq!(row.date, DateKey::new(1, 1, 2020));
        assert_eq!(row.station_code, "ST1");
        assert_eq!(row.station.station_city, "Oslo");
        assert_eq!(row.station.latitude, 59.9);
        assert_eq!(row.measurements.prcp, Some(2.5));
        assert_eq!(row.measurements.tmin, Some(-1.5));
        assert_eq!(row.measurements.snwd, None);
        assert_eq!(row.measurements.pgtm, None);
        assert_eq!(row.measurements.wsfg, Some(12.5));
    }

    #[test]
    fn float_formatted_integers_and_nan_markers_are_accepted() {
        let rows = parse("29.0,2.0,2020.0,ST1,Oslo,Norway,59.9,10.7,94,NaN,nan,NA,null,1,2,3,4,5\n");
        let row = rows.into_iter().next().unwrap().unwrap();
        assert_eq!(row.date, DateKey::new(29, 2, 2020));
        assert_eq!(row.measurements.prcp, None);
        assert_eq!(row.measurements.tmin, None);
        assert_eq!(row.measurements.snwd, Some(1.0));
    }

    #[test]
    fn header_columns_may_be_reordered_and_extended() {
        let text = "ID,STATIONCODE,YEAR,MONTH,DAY,STATIONCITY,STATIONCOUNTRY,LATITUDE,LONGITUDE,ELEVATION,WSFG,WDFG,SNOW,PGTM,SNWD,TMIN,TMAX,TAVG,PRCP\n\
                    9,ST9,2021,3,4,Bergen,Norway,60.4,5.3,12,1,2,3,4,5,6,7,8,9\n";
        let row = SourceRows::from_reader(text.as_bytes(), b',')
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(row.date, DateKey::new(4, 3, 2021));
        assert_eq!(row.station_code, "ST9");
        assert_eq!(row.measurements.prcp, Some(9.0));
        assert_eq!(row.measurements.wsfg, Some(1.0));
    }

    #[test]
    fn missing_header_column_is_reported() {
        let text = HEADER.replace(",WSFG", "");
        let err = SourceRows::from_reader(text.as_bytes(), b',').err().unwrap();
        match err {
            LoadError::MalformedRow { line, column, .. } => {
                assert_eq!(line, 1);
                assert_eq!(column, "WSFG");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn column_names_are_case_sensitive() {
        let text = HEADER.replace("PRCP", "prcp");
        assert!(SourceRows::from_reader(text.as_bytes(), b',').is_err());
    }

    #[test]
    fn non_numeric_measurement_fails_fast() {
        let rows = parse(
            "1,1,2020,ST1,Oslo,Norway,59.9,10.7,94,2.5,,,,,,,,\n\
             2,1,2020,ST1,Oslo,Norway,59.9,10.7,94,heavy,,,,,,,,\n",
        );
        assert!(rows[0].is_ok());
        match rows[1].as_ref().unwrap_err() {
            LoadError::MalformedRow {
                line,
                column,
                reason,
            } => {
                assert_eq!(*line, 3);
                assert_eq!(column, "PRCP");
                assert!(reason.contains("heavy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_and_long_rows_are_malformed() {
        let rows = parse(
            "1,1,2020,ST1,Oslo\n\
             1,1,2020,ST1,Oslo,Norway,59.9,10.7,94,,,,,,,,,,extra\n",
        );
        match rows[0].as_ref().unwrap_err() {
            LoadError::MalformedRow {
                line,
                column,
                reason,
            } => {
                assert_eq!(*line, 2);
                assert_eq!(column, "STATIONCOUNTRY");
                assert_eq!(reason, "expected 18 fields, found 5");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            &rows[1],
            Err(LoadError::MalformedRow { line: 3, reason, .. }) if reason.contains("found 19")
        ));
    }

    #[test]
    fn missing_station_code_and_coordinates_are_rejected() {
        let rows = parse(
            "1,1,2020,,Oslo,Norway,59.9,10.7,94,,,,,,,,,\n\
             1,1,2020,ST1,Oslo,Norway,,10.7,94,,,,,,,,,\n",
        );
        assert!(matches!(
            &rows[0],
            Err(LoadError::MalformedRow { column, .. }) if column == "STATIONCODE"
        ));
        assert!(matches!(
            &rows[1],
            Err(LoadError::MalformedRow { column, .. }) if column == "LATITUDE"
        ));
    }

    #[test]
    fn impossible_dates_are_rejected() {
        let rows = parse(
            "30,2,2020,ST1,Oslo,Norway,59.9,10.7,94,,,,,,,,,\n\
             1,13,2020,ST1,Oslo,Norway,59.9,10.7,94,,,,,,,,,\n\
             1.5,1,2020,ST1,Oslo,Norway,59.9,10.7,94,,,,,,,,,\n",
        );
        assert!(rows.iter().all(|r| matches!(r, Err(LoadError::MalformedRow { .. }))));
    }

    #[test]
    fn alternate_delimiter() {
        let text = format!(
            "{}\n1;1;2020;ST1;Oslo;Norway;59.9;10.7;94;0;;;;;;;;\n",
            HEADER.replace(',', ";")
        );
        let rows: Vec<_> = SourceRows::from_reader(text.as_bytes(), b';')
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measurements.prcp, Some(0.0));
    }

    #[test]
    fn fingerprint_tracks_file_contents() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        writeln!(first, "{HEADER}").unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        writeln!(second, "{HEADER}").unwrap();

        let a = SourceFile::new(first.path(), b',');
        let b = SourceFile::new(second.path(), b',');
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        writeln!(second, "1,1,2020,ST1,Oslo,Norway,59.9,10.7,94,,,,,,,,,").unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(b.rows().unwrap().count(), 1);
    }
}
