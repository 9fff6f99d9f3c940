//! Gateway wire protocol: JSON frames exchanged over the WebSocket transport.
//!
//! Three frame kinds share one socket:
//! - `req`   client → gateway `{type, id, method, params}`
//! - `res`   gateway → client `{type, id, ok, payload | error}`
//! - `event` gateway → client `{type, event, payload, seq, stateVersion}`

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Idempotency window for side-effecting requests.
pub const DEDUPE_TTL_MS: u64 = 60_000;
pub const DEDUPE_MAX_ENTRIES: usize = 10_000;

/// Heartbeat / maintenance tick.
pub const TICK_INTERVAL_MS: u64 = 15_000;

/// Events kept per stream for replay to resuming clients.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Sliding window shared by every rate-limit group.
pub const RATE_WINDOW_MS: u64 = 60_000;

/// Methods whose successful results are cached by request id.
pub const IDEMPOTENT_METHODS: &[&str] = &[
    "chat.send",
    "trade.execute",
    "cron.add",
    "cron.remove",
    "sessions.create",
    "sessions.delete",
];

/// Per-group request budgets inside [`RATE_WINDOW_MS`].
pub const DEFAULT_RATE_LIMITS: &[(&str, u32)] = &[
    ("chat", 10),
    ("trade", 60),
    ("market", 100),
    ("backtest", 5),
];

pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Rate-limit group of a method: everything before the first `.`.
pub fn method_group(method: &str) -> &str {
    method.split_once('.').map_or(method, |(group, _)| group)
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const MISSING_PARAMS: &str = "MISSING_PARAMS";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const AGENT_BUSY: &str = "AGENT_BUSY";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
}

// ── Event names ──────────────────────────────────────────────────────────────

pub mod events {
    pub const CHAT_START: &str = "chat.start";
    pub const CHAT_CHUNK: &str = "chat.chunk";
    pub const CHAT_TOOL: &str = "chat.tool";
    pub const CHAT_COMPLETE: &str = "chat.complete";
    pub const CHAT_ABORTED: &str = "chat.aborted";
    pub const CHAT_ERROR: &str = "chat.error";
    pub const TICK: &str = "tick";
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Req,
    Res,
    Event,
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Milliseconds until the request may be retried (admission errors only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after = Some(retry_after_ms);
        self
    }

    pub fn missing_param(name: &str) -> Self {
        Self::new(error_codes::MISSING_PARAMS, format!("missing parameter: {name}"))
            .with_details(serde_json::json!({ "param": name }))
    }

    pub fn invalid_param(name: &str, expected: &str) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("invalid parameter: {name} (expected {expected})"),
        )
        .with_details(serde_json::json!({ "param": name, "expected": expected }))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_FOUND, what)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            frame_type: FrameType::Req,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: Value) -> Self {
        Self {
            frame_type: FrameType::Res,
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            frame_type: FrameType::Res,
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub event: String,
    pub payload: Value,
    pub seq: u64,
    pub state_version: u64,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value, seq: u64, state_version: u64) -> Self {
        Self {
            frame_type: FrameType::Event,
            event: event.into(),
            payload,
            seq,
            state_version,
        }
    }
}

// ── Inbound parsing ──────────────────────────────────────────────────────────

/// Why an inbound text frame could not be turned into a request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame must be a JSON object")]
    NotObject,
    #[error("unsupported frame type: {0}")]
    UnsupportedType(String),
    #[error("frame has no id")]
    MissingId,
    #[error("frame has no method")]
    MissingMethod,
}

impl FrameError {
    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape::new(error_codes::INVALID_FRAME, self.to_string())
    }
}

/// Parse an inbound text frame into a request.
///
/// Only `req` frames are accepted from clients. On failure the request id is
/// returned alongside the error when one could be read, so the error response
/// can still be correlated.
pub fn parse_request(text: &str) -> Result<RequestFrame, (Option<String>, FrameError)> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| (None, FrameError::Json(e.to_string())))?;
    let Some(obj) = value.as_object() else {
        return Err((None, FrameError::NotObject));
    };

    let id = obj.get("id").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    match obj.get("type").and_then(Value::as_str) {
        Some("req") | None => {},
        Some(other) => return Err((id, FrameError::UnsupportedType(other.to_string()))),
    }

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| (id.clone(), FrameError::MissingMethod))?;
    let id = id.filter(|i| !i.is_empty()).ok_or((None, FrameError::MissingId))?;

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    Ok(RequestFrame::new(id, method, params))
}

// ── Connect handshake ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeParams {
    pub last_seq: u64,
}

/// Parameters of the `connect` handshake request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub resume: Option<ResumeParams>,
}
