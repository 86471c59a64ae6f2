//! Response Parser: image bytes or a structured error out of a raw reply.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::EditError;
use crate::transport::TransportErrorKind;
use crate::truncate_text;

pub const TEXT_PREVIEW_MAX_CHARS: usize = 200;
pub const STATUS_NO_IMAGE: &str = "NO_IMAGE";
pub const STATUS_INVALID_RESPONSE: &str = "INVALID_RESPONSE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Outcome of one remote call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResult {
    Success(ImageBytes),
    ApiError {
        code: Option<i64>,
        status: Option<String>,
        message: String,
    },
    TransportError {
        kind: TransportErrorKind,
        detail: String,
    },
    Cancelled,
}

impl ApiResult {
    pub fn api_error(status: &str, message: impl Into<String>) -> Self {
        Self::ApiError {
            code: None,
            status: Some(status.to_string()),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Splits the result into bytes or an error. `Cancelled` maps to `None`.
    pub fn into_outcome(self) -> Option<Result<ImageBytes, EditError>> {
        match self {
            Self::Success(image) => Some(Ok(image)),
            Self::ApiError {
                code,
                status,
                message,
            } => Some(Err(EditError::Api {
                code,
                status,
                message,
            })),
            Self::TransportError { kind, detail } => {
                Some(Err(EditError::Transport { kind, detail }))
            }
            Self::Cancelled => None,
        }
    }
}

pub fn parse(raw_json: &str) -> ApiResult {
    match serde_json::from_str::<Value>(raw_json) {
        Ok(value) => parse_value(&value),
        Err(err) => ApiResult::api_error(
            STATUS_INVALID_RESPONSE,
            format!(
                "response is not JSON ({err}): {}",
                truncate_text(raw_json, TEXT_PREVIEW_MAX_CHARS)
            ),
        ),
    }
}

pub fn parse_value(response: &Value) -> ApiResult {
    if let Some(error) = response.get("error").filter(|value| !value.is_null()) {
        return api_error_from(error);
    }

    let parts = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for part in parts {
        let Some(inline) = part
            .get("inline_data")
            .or_else(|| part.get("inlineData"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let Some(data) = inline.get("data").and_then(Value::as_str) else {
            continue;
        };
        let mime_type = inline
            .get("mime_type")
            .or_else(|| inline.get("mimeType"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return match BASE64.decode(data.as_bytes()) {
            Ok(bytes) => ApiResult::Success(ImageBytes { bytes, mime_type }),
            Err(err) => ApiResult::api_error(
                STATUS_INVALID_RESPONSE,
                format!("image data is not valid base64: {err}"),
            ),
        };
    }

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    let message = if text.trim().is_empty() {
        "No image was returned. Simplify the prompt and state what must be kept.".to_string()
    } else {
        format!(
            "No image was returned; the model replied with text: {}",
            truncate_text(text.trim(), TEXT_PREVIEW_MAX_CHARS)
        )
    };
    ApiResult::api_error(STATUS_NO_IMAGE, message)
}

fn api_error_from(error: &Value) -> ApiResult {
    let code = error.get("code").and_then(Value::as_i64);
    let status = error
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or("Unknown error")
        .to_string();
    ApiResult::ApiError {
        code,
        status,
        message,
    }
}
