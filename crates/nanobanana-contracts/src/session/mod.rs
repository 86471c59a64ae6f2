mod store;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::limiter::LimiterState;
use crate::logging::LogLevel;
use crate::request::{EditRequest, MAX_REFERENCE_IMAGES};

pub use store::SessionStore;

pub const DEFAULT_OUTPUT_FILE_NAME: &str = "nb_out.png";
pub const DEFAULT_WORK_DIR: &str = "//nb_out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    /// Single image edit; references are ignored.
    Edit,
    /// References first, base render last.
    #[default]
    Compose,
}

/// Where a saved result is routed after the write succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyTarget {
    #[default]
    None,
    ImageEditor,
    Material,
    Compositor,
}

/// Fallback directory when no explicit output path is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultDirectory {
    #[default]
    BaseImage,
    Temp,
    ProjectTextures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    #[default]
    Overwrite,
    UniqueSuffix,
    Versioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default)]
    pub default_dir: DefaultDirectory,
    #[serde(default)]
    pub collision: CollisionPolicy,
    #[serde(default = "default_output_file_name")]
    pub file_name: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            default_dir: DefaultDirectory::default(),
            collision: CollisionPolicy::default(),
            file_name: default_output_file_name(),
        }
    }
}

/// Scene-scoped settings and status for one project.
///
/// Paths are stored as entered. A leading `//` is relative to `project_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub mode: EditMode,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub reference_paths: Vec<String>,
    #[serde(default)]
    pub output_path: String,
    #[serde(default = "default_true")]
    pub open_in_image_editor: bool,
    #[serde(default)]
    pub apply_target: ApplyTarget,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub auto_on_render: bool,
    #[serde(default = "default_work_dir")]
    pub auto_out_dir: String,
    #[serde(default)]
    pub limiter: LimiterState,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub log_dir: String,
    #[serde(default)]
    pub last_info: String,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            mode: EditMode::default(),
            prompt: String::new(),
            base_path: String::new(),
            reference_paths: Vec::new(),
            output_path: String::new(),
            open_in_image_editor: true,
            apply_target: ApplyTarget::default(),
            output: OutputSettings::default(),
            auto_on_render: false,
            auto_out_dir: default_work_dir(),
            limiter: LimiterState::default(),
            verbose: true,
            log_dir: String::new(),
            last_info: String::new(),
            last_error: String::new(),
            project_dir: None,
        }
    }
}

impl SessionState {
    /// Resolves a stored path; `//` prefixes are relative to the project dir.
    pub fn resolve_path(&self, raw: &str) -> Option<PathBuf> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(rest) = trimmed.strip_prefix("//") {
            return Some(self.project_root().join(rest));
        }
        Some(PathBuf::from(trimmed))
    }

    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(DEFAULT_WORK_DIR)
            .unwrap_or_else(|| self.project_root().join("nb_out"))
    }

    pub fn auto_dir(&self) -> PathBuf {
        self.resolve_path(&self.auto_out_dir)
            .unwrap_or_else(|| self.work_dir())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve_path(&self.log_dir)
            .unwrap_or_else(|| self.work_dir())
    }

    pub fn base_image(&self) -> Option<PathBuf> {
        self.resolve_path(&self.base_path)
    }

    /// Reference paths in order, honoring the mode and the two-image cap.
    pub fn references(&self) -> Vec<PathBuf> {
        if self.mode == EditMode::Edit {
            return Vec::new();
        }
        self.reference_paths
            .iter()
            .filter_map(|raw| self.resolve_path(raw))
            .take(MAX_REFERENCE_IMAGES)
            .collect()
    }

    /// Builds the request for a given base image (the render for auto runs).
    pub fn edit_request(&self, base: &Path) -> EditRequest {
        EditRequest::new(self.prompt.clone(), base).with_references(self.references())
    }

    pub fn last_message(&self, level: LogLevel) -> &str {
        match level {
            LogLevel::Info => &self.last_info,
            LogLevel::Error => &self.last_error,
        }
    }

    pub fn set_last_message(&mut self, level: LogLevel, line: String) {
        match level {
            LogLevel::Info => self.last_info = line,
            LogLevel::Error => self.last_error = line,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_work_dir() -> String {
    DEFAULT_WORK_DIR.to_string()
}

fn default_output_file_name() -> String {
    DEFAULT_OUTPUT_FILE_NAME.to_string()
}
