use std::path::PathBuf;

use crate::transport::TransportErrorKind;

/// Everything that can end an edit call without an image.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("API key is not set (GEMINI_API_KEY or preferences)")]
    MissingApiKey,

    #[error("base image not found: {}", .0.display())]
    MissingBaseImage(PathBuf),

    #[error("API error: {}", format_api_error(.code, .status, .message))]
    Api {
        code: Option<i64>,
        status: Option<String>,
        message: String,
    },

    #[error("{kind} failure: {detail}")]
    Transport {
        kind: TransportErrorKind,
        detail: String,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker thread ended without a result")]
    WorkerLost,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(std::io::Error),
}

impl EditError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_api_error(code: &Option<i64>, status: &Option<String>, message: &str) -> String {
    match (code, status) {
        (Some(code), Some(status)) => format!("{code}/{status} {message}"),
        (Some(code), None) => format!("{code} {message}"),
        (None, Some(status)) => format!("{status} {message}"),
        (None, None) => message.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, EditError>;
