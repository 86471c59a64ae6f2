use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const MAX_REFERENCE_IMAGES: usize = 2;

/// One edit call: a prompt, optional style references, and the base image.
///
/// The base image is always attached last; the remote model treats the last
/// image as the edit target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub prompt: String,
    pub base_path: PathBuf,
    #[serde(default)]
    pub reference_paths: Vec<PathBuf>,
}

impl EditRequest {
    pub fn new(prompt: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            base_path: base_path.into(),
            reference_paths: Vec::new(),
        }
    }

    /// Adds a reference image; anything past the second is ignored.
    pub fn with_reference(mut self, path: impl Into<PathBuf>) -> Self {
        if self.reference_paths.len() < MAX_REFERENCE_IMAGES {
            self.reference_paths.push(path.into());
        }
        self
    }

    pub fn with_references<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .fold(self, |request, path| request.with_reference(path))
    }
}
