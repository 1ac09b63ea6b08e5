use crate::config::{ConfigError, MqttConfig};
use crate::mqtt::{metric_topic, read_retained, TransportError};
use chrono::NaiveDate;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Metric read for every meter
pub const LOGGED_METRIC: &str = "total_kwh";
pub const READ_WAIT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum LogbookError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unable to write to {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// One line of the logbook: the date and one integer kWh column per meter.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub date: String,
    pub readings: Vec<(String, Option<i64>)>,
}

impl LogRow {
    /// Columns follow the order of `meters`; a meter without a reading gets
    /// an empty cell.
    pub fn new(date: NaiveDate, meters: &[String], readings: &BTreeMap<String, f64>) -> Self {
        let readings = meters
            .iter()
            .map(|meter| (meter.clone(), readings.get(meter).map(|kwh| kwh.trunc() as i64)))
            .collect();
        LogRow { date: date.format("%d.%m.%Y").to_string(), readings }
    }

    pub fn header(&self) -> String {
        let mut columns = vec!["date".to_string()];
        columns.extend(self.readings.iter().map(|(meter, _)| meter.clone()));
        columns.join(";")
    }

    pub fn to_line(&self) -> String {
        let mut cells = vec![self.date.clone()];
        cells.extend(self.readings.iter().map(|(_, value)| value.map(|v| v.to_string()).unwrap_or_default()));
        cells.join(";")
    }
}

/// Destination for logbook rows.
pub trait RowSink {
    fn append(&mut self, row: &LogRow) -> Result<(), LogbookError>;
}

/// Semicolon separated ledger on disk.
pub struct LedgerFile {
    path: PathBuf,
}

impl LedgerFile {
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(ConfigError::Missing {
                what: "ledger directory",
                path: parent.to_path_buf(),
                remedy: "Create the directory or pass another file with --ledger.",
            });
        }
        Ok(LedgerFile { path: path.to_path_buf() })
    }
}

impl RowSink for LedgerFile {
    fn append(&mut self, row: &LogRow) -> Result<(), LogbookError> {
        let io_err = |source| LogbookError::Write { path: self.path.clone(), source };

        let is_new = !self.path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(io_err)?;
        if is_new {
            debug!("Creating ledger {}", self.path.display());
            writeln!(file, "{}", row.header()).map_err(io_err)?;
        }
        writeln!(file, "{}", row.to_line()).map_err(io_err)?;
        Ok(())
    }
}

/// Payloads are plain numbers as written by the publisher.
pub fn parse_reading(payload: &str) -> Option<f64> {
    payload.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Reads the retained `total_kwh` of every meter. Meters without a (valid)
/// value are missing from the result.
pub async fn collect_readings(
    config: &MqttConfig,
    client_id: &str,
    meters: &[String],
    wait: Duration,
) -> Result<BTreeMap<String, f64>, TransportError> {
    let mut readings = BTreeMap::new();

    for meter in meters {
        let topic = metric_topic(meter, LOGGED_METRIC);
        match read_retained(config, client_id, &topic, wait).await? {
            Some(payload) => match parse_reading(&payload) {
                Some(value) => {
                    info!("{}: {} kWh", meter, value);
                    readings.insert(meter.clone(), value);
                }
                None => warn!("Ignoring unparsable reading '{}' on {}", payload, topic),
            },
            None => warn!("No reading for {} on {}", meter, topic),
        }
    }

    Ok(readings)
}
