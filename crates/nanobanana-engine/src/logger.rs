use nanobanana_contracts::host::TextBuffer;
use nanobanana_contracts::logging::{LogEntry, LogFile, LogLevel};
use nanobanana_contracts::session::SessionState;

pub const CONSOLE_TARGET: &str = "nanobanana";

/// Fans a message out to the console, the last-status slots and, when
/// verbose, the in-scene text buffer and the log file.
pub struct Logger {
    verbose: bool,
    file: Option<LogFile>,
    text: Option<Box<dyn TextBuffer>>,
    last_info: String,
    last_error: String,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            file: None,
            text: None,
            last_info: String::new(),
            last_error: String::new(),
        }
    }

    /// Verbosity, log directory and last-status slots come from the session.
    pub fn from_session(session: &SessionState) -> Self {
        Self {
            verbose: session.verbose,
            file: Some(LogFile::in_dir(session.log_dir())),
            text: None,
            last_info: session.last_info.clone(),
            last_error: session.last_error.clone(),
        }
    }

    pub fn with_file(mut self, file: LogFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_text_buffer(mut self, text: Box<dyn TextBuffer>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::now(level, message);
        match level {
            LogLevel::Info => tracing::info!(target: CONSOLE_TARGET, "{}", entry.message),
            LogLevel::Error => tracing::error!(target: CONSOLE_TARGET, "{}", entry.message),
        }

        let line = entry.line();
        match level {
            LogLevel::Info => self.last_info = line.clone(),
            LogLevel::Error => self.last_error = line.clone(),
        }

        if self.verbose {
            if let Some(text) = self.text.as_mut() {
                if let Err(err) = text.write_line(&line) {
                    tracing::debug!("log text buffer write failed: {err:#}");
                }
            }
            if let Some(file) = &self.file {
                if let Err(err) = file.append(&entry) {
                    let path = file.path().display();
                    tracing::debug!(%path, "log file append failed: {err:#}");
                }
            }
        }
        entry
    }

    pub fn info(&mut self, message: impl Into<String>) -> LogEntry {
        self.log(LogLevel::Info, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> LogEntry {
        self.log(LogLevel::Error, message)
    }

    pub fn last(&self, level: LogLevel) -> &str {
        match level {
            LogLevel::Info => &self.last_info,
            LogLevel::Error => &self.last_error,
        }
    }

    /// Copies the last-status slots back into the session for persistence.
    pub fn sync_into(&self, session: &mut SessionState) {
        session.set_last_message(LogLevel::Info, self.last_info.clone());
        session.set_last_message(LogLevel::Error, self.last_error.clone());
    }
}
