//! Audit Log
//!
//! Append-only operational audit: a daily-rotated plain-text log with
//! category tags and a daily CSV of executed paper trades. Rotation is by
//! UTC date embedded in the filename; the writer reopens lazily when the
//! day rolls over.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Category tag on every audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Boot,
    Shutdown,
    Crash,
    Trade,
    Close,
    Lifecycle,
    Api,
    Engine,
    Ledger,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Boot => "BOOT",
            LogCategory::Shutdown => "SHUTDOWN",
            LogCategory::Crash => "CRASH",
            LogCategory::Trade => "TRADE",
            LogCategory::Close => "CLOSE",
            LogCategory::Lifecycle => "LIFECYCLE",
            LogCategory::Api => "API",
            LogCategory::Engine => "ENGINE",
            LogCategory::Ledger => "LEDGER",
            LogCategory::Error => "ERROR",
        }
    }
}

/// One row of the daily trades CSV.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCsvRecord {
    pub timestamp: i64,
    pub profile_address: String,
    pub market_question: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub intent: String,
}

struct AuditInner {
    day: String,
    text: File,
    trades: csv::Writer<File>,
}

/// Daily-rotated audit writer. Cheap to share behind an `Arc`; writes are
/// serialized by an internal mutex.
pub struct AuditLog {
    logs_dir: PathBuf,
    inner: Mutex<Option<AuditInner>>,
}

impl AuditLog {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            inner: Mutex::new(None),
        }
    }

    /// Append one tagged line to today's audit file.
    pub fn log(&self, category: LogCategory, message: &str) {
        let now = Utc::now();
        let line = format!(
            "[{}] [{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            category.as_str(),
            message
        );
        let mut guard = self.inner.lock().unwrap();
        match self.writer_for_today(&mut guard) {
            Ok(inner) => {
                if let Err(e) = inner.text.write_all(line.as_bytes()) {
                    warn!(error = %e, "Audit write failed");
                }
            }
            Err(e) => warn!(error = %e, "Audit file unavailable"),
        }
    }

    /// Append one trade row to today's CSV.
    pub fn trade(&self, record: &TradeCsvRecord) {
        let mut guard = self.inner.lock().unwrap();
        match self.writer_for_today(&mut guard) {
            Ok(inner) => {
                if let Err(e) = inner.trades.serialize(record).and_then(|_| {
                    inner.trades.flush().map_err(csv::Error::from)
                }) {
                    warn!(error = %e, "Trade CSV write failed");
                }
            }
            Err(e) => warn!(error = %e, "Trade CSV unavailable"),
        }
    }

    /// Flush buffered output; called on shutdown.
    pub fn flush(&self) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(inner) = guard.as_mut() {
            let _ = inner.text.flush();
            let _ = inner.trades.flush();
        }
    }

    fn writer_for_today<'a>(
        &self,
        slot: &'a mut Option<AuditInner>,
    ) -> Result<&'a mut AuditInner> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let stale = slot.as_ref().map(|i| i.day != today).unwrap_or(true);
        if stale {
            fs::create_dir_all(&self.logs_dir).context("create logs directory")?;

            let text_path = self.logs_dir.join(format!("bot_{today}.txt"));
            let text = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&text_path)
                .with_context(|| format!("open {}", text_path.display()))?;

            let csv_path = self.logs_dir.join(format!("trades_{today}.csv"));
            let write_header = !csv_path.exists();
            let csv_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&csv_path)
                .with_context(|| format!("open {}", csv_path.display()))?;
            let trades = csv::WriterBuilder::new()
                .has_headers(write_header)
                .from_writer(csv_file);

            *slot = Some(AuditInner {
                day: today,
                text,
                trades,
            });
        }
        Ok(slot.as_mut().unwrap())
    }
}
