use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const LOG_FILE_NAME: &str = "nb_log.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    /// `[2025-01-31 12:00:00] [INFO] message`
    pub fn line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Append-only writer for `nb_log.txt`.
///
/// One rendered [`LogEntry`] per line. The parent directory is created on
/// every append so the log dir may be removed while a session is running.
#[derive(Debug, Clone)]
pub struct LogFile {
    inner: Arc<LogFileInner>,
}

#[derive(Debug)]
struct LogFileInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LogFileInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(LOG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = entry.line();
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("log file lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
