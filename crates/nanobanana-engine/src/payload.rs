//! Request Builder: prompt + ordered image attachments.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nanobanana_contracts::request::EditRequest;
use serde::Serialize;

use crate::error::{EditError, Result};

/// Appended to every user prompt. The base render is attached last, so the
/// model is told to treat the last image as the edit target.
pub const EDIT_GUARD: &str = "Do not generate a new image from scratch. \
Edit the last attached image (the render): keep its composition, camera, lighting, \
resolution, aspect ratio and the shapes of its subjects. \
Use any other attached images only as hints for color, texture and mood.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Png,
    Jpeg,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Extension sniffing; anything unrecognized is sent as PNG.
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg") | Some("jpeg") => Self::Jpeg,
            _ => Self::Png,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: MimeType,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|err| EditError::io(path, err))?;
        Ok(Self {
            mime_type: MimeType::for_path(path),
            bytes,
        })
    }

    fn into_part(self) -> Part {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: self.mime_type.as_str().to_string(),
                data: BASE64.encode(self.bytes),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiPayload {
    contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl ApiPayload {
    pub fn parts(&self) -> &[Part] {
        self.contents
            .first()
            .map(|content| content.parts.as_slice())
            .unwrap_or(&[])
    }

    pub fn image_count(&self) -> usize {
        self.parts()
            .iter()
            .filter(|part| matches!(part, Part::InlineData { .. }))
            .count()
    }

    pub fn prompt_text(&self) -> Option<&str> {
        self.parts().iter().find_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            Part::InlineData { .. } => None,
        })
    }
}

pub fn augment_prompt(user_text: &str) -> String {
    let base = user_text.trim();
    if base.is_empty() {
        EDIT_GUARD.to_string()
    } else {
        format!("{base}\n{EDIT_GUARD}")
    }
}

/// Checks the one mandatory precondition without reading any bytes.
pub fn validate(request: &EditRequest) -> Result<()> {
    if request.base_path.as_os_str().is_empty() || !request.base_path.is_file() {
        return Err(EditError::MissingBaseImage(request.base_path.clone()));
    }
    Ok(())
}

/// Assembles `[text] + [references...] + [base]`.
///
/// References that do not exist on disk are dropped.
pub fn build(request: &EditRequest) -> Result<ApiPayload> {
    validate(request)?;

    let mut parts = vec![Part::Text {
        text: augment_prompt(&request.prompt),
    }];
    for reference in &request.reference_paths {
        if !reference.is_file() {
            tracing::debug!(path = %reference.display(), "skipping missing reference image");
            continue;
        }
        parts.push(Attachment::from_path(reference)?.into_part());
    }
    parts.push(Attachment::from_path(&request.base_path)?.into_part());

    Ok(ApiPayload {
        contents: vec![Content { parts }],
    })
}
