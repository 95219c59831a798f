// =============================================================================
// Logger — append-only JSONL trade log with a dedicated writer task
// =============================================================================
//
// Same shape as the reconciliation loop's dedicated background task: callers
// never touch the filesystem directly. `log()` is a non-blocking channel
// send so a slow disk never stalls the trading loop; a full channel drops
// the entry and logs a warning through `tracing` instead of blocking.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

const CHANNEL_CAPACITY: usize = 4096;
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const GZIP_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Serialize)]
pub enum LogEntryKind {
    Signal,
    Execution,
    Close,
    Error,
}

#[derive(Debug, Clone, Serialize)]
struct LogRecord {
    kind: LogEntryKind,
    timestamp: chrono::DateTime<Utc>,
    payload: serde_json::Value,
}

pub struct Logger {
    tx: mpsc::Sender<LogRecord>,
}

impl Logger {
    /// Spawns the dedicated writer task and returns a cheap, cloneable
    /// handle. `log_path` is the active file; rotated files are written
    /// alongside it with a timestamp suffix.
    pub fn spawn(log_path: impl Into<PathBuf>) -> Self {
        let log_path = log_path.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_writer(log_path, rx));
        Self { tx }
    }

    fn log(&self, kind: LogEntryKind, payload: serde_json::Value) {
        let record = LogRecord { kind, timestamp: Utc::now(), payload };
        if self.tx.try_send(record).is_err() {
            warn!("logger channel full or closed, dropping log entry");
        }
    }

    pub fn log_signal(&self, payload: impl Serialize) {
        self.log(LogEntryKind::Signal, serde_json::to_value(payload).unwrap_or_default());
    }

    pub fn log_execution(&self, payload: impl Serialize) {
        self.log(LogEntryKind::Execution, serde_json::to_value(payload).unwrap_or_default());
    }

    pub fn log_close(&self, payload: impl Serialize) {
        self.log(LogEntryKind::Close, serde_json::to_value(payload).unwrap_or_default());
    }

    pub fn log_error(&self, component: &str, message: &str) {
        self.log(LogEntryKind::Error, serde_json::json!({ "component": component, "message": message }));
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

async fn run_writer(log_path: PathBuf, mut rx: mpsc::Receiver<LogRecord>) {
    gzip_stale_rotations(&log_path);

    while let Some(record) = rx.recv().await {
        if let Err(e) = append_and_maybe_rotate(&log_path, &record) {
            error!(error = %e, "failed to write log entry");
        }
    }
}

fn append_and_maybe_rotate(log_path: &Path, record: &LogRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let line = serde_json::to_string(record).unwrap_or_default();
    writeln!(file, "{line}")?;

    if file.metadata()?.len() >= ROTATE_AT_BYTES {
        rotate(log_path)?;
    }
    Ok(())
}

fn rotate(log_path: &Path) -> std::io::Result<()> {
    let suffix = Utc::now().format("%Y%m%dT%H%M%S");
    let rotated = log_path.with_extension(format!("{suffix}.jsonl"));
    fs::rename(log_path, &rotated)?;
    Ok(())
}

/// Compresses rotated log files older than `GZIP_AFTER_DAYS`, run once at
/// writer startup rather than on a timer — rotations are infrequent enough
/// that a per-startup sweep is sufficient.
fn gzip_stale_rotations(log_path: &Path) {
    let Some(dir) = log_path.parent() else { return };
    let Ok(entries) = fs::read_dir(dir) else { return };
    let cutoff = Utc::now() - chrono::Duration::days(GZIP_AFTER_DAYS);

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let modified: chrono::DateTime<Utc> = modified.into();
        if modified > cutoff {
            continue;
        }
        if let Err(e) = gzip_file(&path) {
            error!(error = %e, path = %path.display(), "failed to gzip stale log file");
        }
    }
}

fn gzip_file(path: &Path) -> std::io::Result<()> {
    let data = fs::read(path)?;
    let gz_path = path.with_extension("jsonl.gz");
    let out = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[tokio::test]
    async fn appends_jsonl_lines_for_each_entry() {
        let dir = std::env::temp_dir().join(format!("logger-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");

        let logger = Logger::spawn(path.clone());
        logger.log_signal(serde_json::json!({ "symbol": "BTCUSDT" }));
        logger.log_error("execution", "boom");

        // Give the writer task a moment to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let file = File::open(&path).unwrap();
        let lines: Vec<_> = std::io::BufReader::new(file).lines().collect();
        assert_eq!(lines.len(), 2);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rotation_appends_timestamp_suffix_to_filename() {
        let dir = std::env::temp_dir().join(format!("logger-rotate-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");
        fs::write(&path, b"x").unwrap();

        rotate(&path).unwrap();
        assert!(!path.exists());
        let rotated_exists = fs::read_dir(&dir).unwrap().any(|e| e.unwrap().path() != path);
        assert!(rotated_exists);

        fs::remove_dir_all(&dir).ok();
    }
}
