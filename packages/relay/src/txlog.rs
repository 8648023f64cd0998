//! Transaction Log
//!
//! Append-only CSV record of every forwarded identifier. The file is created
//! with a `Sender,CA,Timestamp` header on first use and then only appended to,
//! one flushed row per forward, so it can be tailed while the relay runs.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Column header written when the log is created
pub const CSV_HEADER: [&str; 3] = ["Sender", "CA", "Timestamp"];

/// Timestamp layout used in log rows
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors that can occur while writing or reading the log
#[derive(Error, Debug)]
pub enum TxLogError {
    #[error("Transaction log I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One forwarded identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "Sender")]
    pub sender: String,
    #[serde(rename = "CA")]
    pub ca: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

impl TransactionRecord {
    pub fn new(sender: impl Into<String>, ca: impl Into<String>, at: DateTime<Local>) -> Self {
        Self {
            sender: sender.into(),
            ca: ca.into(),
            timestamp: format_timestamp(at),
        }
    }
}

/// Format a local time the way log rows store it
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Handle on the CSV transaction log
#[derive(Debug, Clone)]
pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    /// Open the log at `path`, creating it with the header row if absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TxLogError> {
        let path = path.into();
        let log = Self { path };

        if !log.path.exists() {
            let mut writer = csv::Writer::from_path(&log.path)?;
            writer.write_record(CSV_HEADER)?;
            writer.flush().map_err(|e| log.io_error(e))?;
            info!("Created transaction log at {}", log.path.display());
        }

        Ok(log)
    }

    /// Append one row and flush it
    pub fn append(&self, record: &TransactionRecord) -> Result<(), TxLogError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush().map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Read back every row after the header
    pub fn records(&self) -> Result<Vec<TransactionRecord>, TxLogError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)?;
        reader
            .deserialize()
            .collect::<Result<Vec<TransactionRecord>, csv::Error>>()
            .map_err(TxLogError::from)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> TxLogError {
        TxLogError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn record(sender: &str, ca: &str) -> TransactionRecord {
        TransactionRecord {
            sender: sender.to_string(),
            ca: ca.to_string(),
            timestamp: "2024-03-01 12:30:00".to_string(),
        }
    }

    // ==================== open tests ====================

    #[test]
    fn test_open_creates_file_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transactions_log.csv");

        TransactionLog::open(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "Sender,CA,Timestamp\n");
    }

    #[test]
    fn test_open_existing_file_keeps_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transactions_log.csv");
        fs::write(&path, "Sender,CA,Timestamp\nalpha,abc,2024-01-01 00:00:00\n").unwrap();

        let log = TransactionLog::open(&path).unwrap();

        assert_eq!(log.records().unwrap().len(), 1);
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let result = TransactionLog::open(dir.path().join("nope").join("log.csv"));
        assert!(result.is_err());
    }

    // ==================== append tests ====================

    #[test]
    fn test_append_writes_row_in_column_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transactions_log.csv");
        let log = TransactionLog::open(&path).unwrap();

        log.append(&record("alpha", "CA111")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "Sender,CA,Timestamp\nalpha,CA111,2024-03-01 12:30:00\n"
        );
    }

    #[test]
    fn test_append_multiple_rows_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let log = TransactionLog::open(dir.path().join("log.csv")).unwrap();

        log.append(&record("alpha", "CA111")).unwrap();
        log.append(&record("Beta Calls", "CA222")).unwrap();

        let records = log.records().unwrap();
        assert_eq!(records, vec![record("alpha", "CA111"), record("Beta Calls", "CA222")]);
    }

    #[test]
    fn test_append_quotes_sender_with_comma() {
        let dir = TempDir::new().unwrap();
        let log = TransactionLog::open(dir.path().join("log.csv")).unwrap();

        log.append(&record("Gems, Calls & More", "CA111")).unwrap();

        let records = log.records().unwrap();
        assert_eq!(records[0].sender, "Gems, Calls & More");
    }

    #[test]
    fn test_records_reads_header_with_spaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(&path, "Sender, CA, Timestamp\nalpha, CA111, 2024-03-01 12:30:00\n").unwrap();

        let log = TransactionLog::open(&path).unwrap();
        assert_eq!(log.records().unwrap(), vec![record("alpha", "CA111")]);
    }

    // ==================== TransactionRecord tests ====================

    #[test]
    fn test_record_timestamp_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        let record = TransactionRecord::new("alpha", "CA111", at);
        assert_eq!(record.timestamp, "2024-03-01 09:05:07");
    }
}
