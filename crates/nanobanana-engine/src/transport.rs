//! Transport: the HTTP call, its retry policy, and cooperative cancellation.

use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::payload::{ApiPayload, Part};
use crate::response::{self, ApiResult, ImageBytes};
use crate::{non_empty_env, truncate_text};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const API_KEY_HEADER: &str = "x-goog-api-key";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ERROR_DETAIL_MAX_CHARS: usize = 512;

/// Shared advisory cancellation flag. Single writer, single reader.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps in short slices. Returns `false` if cancelled meanwhile.
    pub fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Http(u16),
    Body,
    /// The request could not be built or followed, e.g. a malformed API base.
    Request,
}

impl TransportErrorKind {
    /// Connection drops, timeouts, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect | Self::Timeout => true,
            Self::Http(status) => matches!(status, 408 | 429) || *status >= 500,
            Self::Body | Self::Request => false,
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_builder() || err.is_redirect() {
            Self::Request
        } else if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Http(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            Self::Body
        } else {
            Self::Connect
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connection"),
            Self::Timeout => f.write_str("timeout"),
            Self::Http(status) => write!(f, "HTTP {status}"),
            Self::Body => f.write_str("response body"),
            Self::Request => f.write_str("request"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::retrying()
    }
}

impl RetryPolicy {
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout: Duration::from_secs(180),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    pub fn retrying() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Delay before the attempt following `attempt` (1-based), or `None`
    /// when the budget is spent. Doubles from `base_delay`, capped.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

/// Runs `attempt_once` until it succeeds, fails permanently, the budget is
/// spent, or `cancel` is set. The flag is only checked between attempts.
pub fn send_with_retries(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut attempt_once: impl FnMut(u32) -> ApiResult,
) -> ApiResult {
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return ApiResult::Cancelled;
        }
        let result = attempt_once(attempt);
        let retryable = matches!(
            &result,
            ApiResult::TransportError { kind, .. } if kind.is_retryable()
        );
        if !retryable {
            return result;
        }
        let Some(delay) = policy.delay_after(attempt) else {
            return result;
        };
        if let ApiResult::TransportError { kind, detail } = &result {
            tracing::warn!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %kind,
                "retrying after transient transport failure: {detail}"
            );
        }
        if !cancel.sleep(delay) {
            return ApiResult::Cancelled;
        }
        attempt += 1;
    }
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, payload: &ApiPayload, api_key: &str, cancel: &CancelFlag) -> ApiResult;
}

pub struct HttpTransport {
    api_base: String,
    model: String,
    policy: RetryPolicy,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: DEFAULT_MODEL.to_string(),
            policy,
            http: HttpClient::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model.trim().to_string();
        }
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn attempt_once(&self, endpoint: &str, payload: &ApiPayload, api_key: &str) -> ApiResult {
        let response = self
            .http
            .post(endpoint)
            .header(API_KEY_HEADER, api_key.trim())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.policy.attempt_timeout)
            .json(payload)
            .send();
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return ApiResult::TransportError {
                    kind: TransportErrorKind::from_reqwest(&err),
                    detail: err.to_string(),
                };
            }
        };

        let status = response.status();
        let body = match response.text() {
            Ok(body) => body,
            Err(err) => {
                return ApiResult::TransportError {
                    kind: TransportErrorKind::from_reqwest(&err),
                    detail: format!("failed reading response body: {err}"),
                };
            }
        };
        if !status.is_success() {
            return ApiResult::TransportError {
                kind: TransportErrorKind::Http(status.as_u16()),
                detail: http_error_detail(&body),
            };
        }
        response::parse(&body)
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    fn send(&self, payload: &ApiPayload, api_key: &str, cancel: &CancelFlag) -> ApiResult {
        let endpoint = self.endpoint();
        send_with_retries(&self.policy, cancel, |attempt| {
            tracing::debug!(attempt, %endpoint, "sending edit request");
            self.attempt_once(&endpoint, payload, api_key)
        })
    }
}

/// Prefers the structured error envelope when the body carries one.
fn http_error_detail(body: &str) -> String {
    let envelope = serde_json::from_str::<Value>(body).ok();
    let error = envelope.as_ref().and_then(|value| value.get("error"));
    match error {
        Some(error) => {
            let status = error.get("status").and_then(Value::as_str).unwrap_or("");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            let detail = format!("{status} {message}");
            truncate_text(detail.trim(), ERROR_DETAIL_MAX_CHARS)
        }
        None => truncate_text(body.trim(), ERROR_DETAIL_MAX_CHARS),
    }
}

/// Offline transport: answers with a flat PNG the size of the base image,
/// colored from a hash of the prompt.
#[derive(Debug, Clone, Default)]
pub struct DryrunTransport {
    latency: Duration,
}

impl DryrunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Transport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn send(&self, payload: &ApiPayload, _api_key: &str, cancel: &CancelFlag) -> ApiResult {
        if cancel.is_cancelled() {
            return ApiResult::Cancelled;
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let (width, height) = base_image_dims(payload).unwrap_or((512, 512));
        let (r, g, b) = color_from_prompt(payload.prompt_text().unwrap_or_default());
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut out = Cursor::new(Vec::new());
        match canvas.write_to(&mut out, image::ImageFormat::Png) {
            Ok(()) => ApiResult::Success(ImageBytes {
                bytes: out.into_inner(),
                mime_type: Some("image/png".to_string()),
            }),
            Err(err) => ApiResult::api_error(
                response::STATUS_INVALID_RESPONSE,
                format!("dry-run encode failed: {err}"),
            ),
        }
    }
}

fn base_image_dims(payload: &ApiPayload) -> Option<(u32, u32)> {
    let Some(Part::InlineData { inline_data }) = payload.parts().last() else {
        return None;
    };
    let bytes = BASE64.decode(inline_data.data.as_bytes()).ok()?;
    let decoded = image::load_from_memory(&bytes).ok()?;
    Some((decoded.width().clamp(1, 4096), decoded.height().clamp(1, 4096)))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}
