use std::path::{Path, PathBuf};

use anyhow::Context;

use super::SessionState;

/// JSON file backing a [`SessionState`] between host invocations.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the session. A missing file yields defaults with `project_dir`
    /// set to the file's directory.
    pub fn load(&self) -> anyhow::Result<SessionState> {
        let mut state = match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str::<SessionState>(&raw)
                .with_context(|| format!("invalid session file {}", self.path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no session file; using defaults");
                SessionState::default()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {}", self.path.display()));
            }
        };
        if state.project_dir.is_none() {
            state.project_dir = self
                .path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf);
        }
        Ok(state)
    }

    pub fn save(&self, state: &SessionState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn update<T>(&self, apply: impl FnOnce(&mut SessionState) -> T) -> anyhow::Result<T> {
        let mut state = self.load()?;
        let out = apply(&mut state);
        self.save(&state)?;
        Ok(out)
    }
}
