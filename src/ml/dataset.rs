//! Corpus loading from CSV exports
//!
//! Every row yields its own outcome: a malformed row is rejected with a
//! reason and its line number instead of being defaulted, so the number of
//! discarded rows stays observable.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::features::{FeatureError, HourlyRecord, RawHourlyRecord, RawRideRecord, RideRecord};

/// Errors that abort loading a whole corpus
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("corpus file not found: {0}")]
    NotFound(String),
    #[error("failed to read corpus {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// A row that was read but could not be used
#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    /// 1-based line number in the source, header included
    pub line: u64,
    pub reason: String,
}

/// Records accepted from a corpus plus the rows that were rejected
#[derive(Debug, Clone)]
pub struct LoadReport<T> {
    pub records: Vec<T>,
    pub rejected: Vec<RowRejection>,
}

impl<T> LoadReport<T> {
    pub fn accepted(&self) -> usize {
        self.records.len()
    }

    /// Log a one-line summary and the first few rejections
    pub fn log_summary(&self, corpus: &str) {
        tracing::info!(
            "Loaded {} corpus: {} rows accepted, {} rejected",
            corpus,
            self.records.len(),
            self.rejected.len()
        );
        for rejection in self.rejected.iter().take(10) {
            tracing::warn!("Rejected line {}: {}", rejection.line, rejection.reason);
        }
    }
}

fn read_rows<Raw, T, R, F>(reader: R, parse: F) -> LoadReport<T>
where
    Raw: DeserializeOwned,
    R: Read,
    F: Fn(&Raw) -> Result<T, FeatureError>,
{
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    let mut rejected = Vec::new();

    for (index, row) in csv_reader.deserialize::<Raw>().enumerate() {
        // header is line 1
        let fallback_line = index as u64 + 2;
        match row {
            Ok(raw) => match parse(&raw) {
                Ok(record) => records.push(record),
                Err(e) => rejected.push(RowRejection {
                    line: fallback_line,
                    reason: e.to_string(),
                }),
            },
            Err(e) => rejected.push(RowRejection {
                line: e.position().map(|p| p.line()).unwrap_or(fallback_line),
                reason: e.to_string(),
            }),
        }
    }

    LoadReport { records, rejected }
}

fn open(path: &Path) -> Result<File, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    File::open(path).map_err(|e| DatasetError::Csv {
        path: path.display().to_string(),
        source: csv::Error::from(e),
    })
}

/// Read hourly records from any CSV source
pub fn read_hourly<R: Read>(reader: R) -> LoadReport<HourlyRecord> {
    read_rows::<RawHourlyRecord, _, _, _>(reader, HourlyRecord::parse)
}

/// Read ride records from any CSV source
pub fn read_rides<R: Read>(reader: R) -> LoadReport<RideRecord> {
    read_rows::<RawRideRecord, _, _, _>(reader, RideRecord::parse)
}

/// Load the hourly weather corpus (`datetime,season,...,count`)
pub fn load_hourly_csv(path: &Path) -> Result<LoadReport<HourlyRecord>, DatasetError> {
    Ok(read_hourly(open(path)?))
}

/// Load a ride export (`region,timestamp,duration,distance,...`)
pub fn load_rides_csv(path: &Path) -> Result<LoadReport<RideRecord>, DatasetError> {
    Ok(read_rides(open(path)?))
}
