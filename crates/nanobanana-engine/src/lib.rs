use std::env;

use nanobanana_contracts::host::Preferences;

pub mod auto;
mod error;
pub mod logger;
pub mod manual;
pub mod output;
pub mod payload;
pub mod response;
pub mod task;
pub mod transport;

pub use auto::{AutoMode, FrameOutcome, RenderSubscription};
pub use error::{EditError, Result};
pub use logger::Logger;
pub use manual::ManualRun;
pub use output::{ApplyOutcome, OutputManager};
pub use response::{ApiResult, ImageBytes};
pub use task::{EditJob, TaskOutcome, TaskPoller, TaskState, Tick};
pub use transport::{CancelFlag, DryrunTransport, HttpTransport, RetryPolicy, Transport};

pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// First non-empty key among `GEMINI_API_KEY` and `GOOGLE_API_KEY`.
pub fn api_key_from_env() -> Option<String> {
    API_KEY_ENV_VARS.iter().find_map(|key| non_empty_env(key))
}

/// Preferences backed by the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvPreferences {
    api_key: Option<String>,
}

impl EnvPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins a key that wins over the environment.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = Some(api_key.trim().to_string()).filter(|key| !key.is_empty());
        self
    }
}

impl Preferences for EnvPreferences {
    fn api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(api_key_from_env)
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
