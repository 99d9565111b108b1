//! Append-only JSON Lines audit log.
//!
//! Every record is a complete JSON object on its own line. A record is either
//! fully on disk or absent: it goes out in one `write` call and a failed write
//! is truncated away before the error is reported.

mod record;

pub use record::{EventType, LogRecord};

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Writes [`LogRecord`]s to a JSONL file
#[derive(Debug)]
pub struct EventLogger {
    path: PathBuf,
    records_written: u64,
    records_dropped: u64,
}

impl EventLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(?e, dir = %parent.display(), "Failed to create log directory");
            }
        }

        tracing::info!(path = %path.display(), "📝 Event log (append mode)");

        Self {
            path,
            records_written: 0,
            records_dropped: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped
    }

    /// Append one record. On failure nothing of the record remains in the file.
    pub fn append(&mut self, record: &LogRecord) -> PersistenceResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let prior_len = file.metadata()?.len();

        let outcome = match file.write(&line) {
            Ok(n) if n == line.len() => file.sync_data().map_err(PersistenceError::from),
            Ok(n) => Err(PersistenceError::ShortWrite {
                written: n,
                expected: line.len(),
            }),
            Err(e) => Err(e.into()),
        };

        if let Err(err) = outcome {
            if let Err(truncate_err) = file.set_len(prior_len) {
                tracing::error!(
                    error = %truncate_err,
                    path = %self.path.display(),
                    "Failed to roll back partial log record"
                );
            }
            return Err(err);
        }

        self.records_written += 1;
        Ok(())
    }

    /// Append with one retry; a record that still fails goes to stderr and is dropped.
    /// Never returns an error so logging cannot stop trading.
    pub fn record(&mut self, record: LogRecord) {
        let first = match self.append(&record) {
            Ok(()) => return,
            Err(e) => e,
        };
        tracing::warn!(
            error = %first,
            event = ?record.event_type,
            "Event log write failed, retrying once"
        );

        if let Err(second) = self.append(&record) {
            self.records_dropped += 1;
            tracing::error!(
                error = %second,
                event = ?record.event_type,
                dropped = self.records_dropped,
                "Event log write failed twice, dropping record"
            );
            match serde_json::to_string(&record) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{:?}", record),
            }
        }
    }
}

/// Read every complete record from a log file
pub fn read_log(path: impl AsRef<Path>) -> PersistenceResult<Vec<LogRecord>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LifecycleState, Position, PositionSide};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_append_writes_one_line_per_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bot_log.jsonl");
        let mut logger = EventLogger::new(&path);

        let position = Position {
            side: PositionSide::Long,
            entry_price: 60000.0,
            size: 0.01,
            stop_price: Some(58800.0),
            ..Position::flat("BTCUSDT", 25)
        };
        logger
            .append(
                &LogRecord::new(EventType::Entry, "BTCUSDT", Utc::now())
                    .with_position(&position)
                    .with_state(LifecycleState::Open),
            )
            .unwrap();
        logger
            .append(&LogRecord::new(EventType::BotStopped, "BTCUSDT", Utc::now()))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));

        let records = read_log(&path).unwrap();
        assert_eq!(records[0].event_type, EventType::Entry);
        assert_eq!(records[0].stop_price, Some(58800.0));
        assert_eq!(records[0].state, Some(LifecycleState::Open));
        assert_eq!(logger.records_written(), 2);
    }

    #[test]
    fn test_field_names_on_the_wire() {
        let record = LogRecord::new(EventType::TrailStop, "BTCUSDT", Utc::now())
            .with_stop_price(60885.0)
            .with_reason("trail");
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["event_type"], "trail_stop");
        assert_eq!(json["stop_price"], 60885.0);
        assert!(json.get("timestamp").is_some());
        assert!(json.get("pnl").is_none()); // unset fields omitted
    }

    #[test]
    fn test_append_failure_reported() {
        // A directory cannot be opened for appending
        let temp_dir = TempDir::new().unwrap();
        let mut logger = EventLogger::new(temp_dir.path());

        let err = logger
            .append(&LogRecord::new(EventType::Error, "BTCUSDT", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
    }

    #[test]
    fn test_record_drops_after_retry() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = EventLogger::new(temp_dir.path());

        logger.record(LogRecord::new(EventType::Error, "BTCUSDT", Utc::now()));

        assert_eq!(logger.records_dropped(), 1);
        assert_eq!(logger.records_written(), 0);
    }
}
