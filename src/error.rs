//! Error taxonomy for the relay.
//!
//! Every upstream failure is normalized into an [`ErrorDetail`] before it is
//! logged or rendered into a per-device result string, so callers see the same
//! shape regardless of which call failed.

use std::fmt;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Structured description of an upstream failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    /// Originating call, e.g. `PUT /api/accessories/{id}`.
    pub call: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorDetail {
    /// Detail for failures that never reached the network.
    pub fn local(call: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
            status: None,
            status_text: None,
            call: call.into(),
            data: None,
        }
    }
}

/// Compact JSON, the form used in logs and per-device result strings.
impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str(&self.message),
        }
    }
}

/// Failure of a request/response call against the Homebridge REST API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection refused, DNS failure, timeout, etc.
    #[error("{call}: {message}")]
    Request {
        call: String,
        message: String,
        code: &'static str,
    },

    /// Homebridge answered with a non-2xx status.
    #[error("{call}: HTTP {status}: {message}")]
    Status {
        call: String,
        status: u16,
        message: String,
        data: Option<Value>,
    },

    /// The response body could not be decoded.
    #[error("{call}: invalid response body: {message}")]
    Decode { call: String, message: String },
}

impl UpstreamError {
    pub(crate) fn from_reqwest(call: &str, err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "TIMEOUT"
        } else if err.is_connect() {
            "CONNECT_FAILED"
        } else {
            "REQUEST_FAILED"
        };
        Self::Request {
            call: call.to_string(),
            // The URL repeats what `call` already says.
            message: err.without_url().to_string(),
            code,
        }
    }

    /// HTTP status of the failed call, if the upstream answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Homebridge answers 400/404 for accessories it has not loaded yet.
    pub fn is_cold_cache(&self) -> bool {
        matches!(self.status(), Some(400 | 404))
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Request {
                call,
                message,
                code,
            } => ErrorDetail {
                message: message.clone(),
                code: Some((*code).to_string()),
                status: None,
                status_text: None,
                call: call.clone(),
                data: None,
            },
            Self::Status {
                call,
                status,
                message,
                data,
            } => ErrorDetail {
                message: message.clone(),
                code: None,
                status: Some(*status),
                status_text: StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .map(str::to_string),
                call: call.clone(),
                data: data.clone(),
            },
            Self::Decode { call, message } => ErrorDetail {
                message: message.clone(),
                code: Some("DECODE_FAILED".to_string()),
                status: None,
                status_text: None,
                call: call.clone(),
                data: None,
            },
        }
    }
}

/// Login against the upstream failed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login failed: {0}")]
    Login(#[from] UpstreamError),

    #[error("login response carried no access_token")]
    MissingToken,
}

impl AuthError {
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Login(e) => e.detail(),
            Self::MissingToken => ErrorDetail::local(
                "POST /api/auth/login",
                "MISSING_TOKEN",
                self.to_string(),
            ),
        }
    }
}

/// Failure of the event-stream channel. Always answered by falling back to
/// the request/response channel.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("event stream disabled")]
    Disabled,

    #[error("no session token")]
    NoSession,

    #[error("event stream connect failed: {0}")]
    Connect(String),

    #[error("event stream connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("event stream not connected")]
    NotConnected,

    #[error("event stream belongs to session generation {channel}, current is {current}")]
    StaleGeneration { channel: u64, current: u64 },

    #[error("no ready-for-control signal within {0}ms")]
    ReadyTimeout(u64),

    #[error("event stream send failed: {0}")]
    Send(String),
}

impl TransportError {
    pub fn detail(&self) -> ErrorDetail {
        let code = match self {
            Self::Disabled => "DISABLED",
            Self::NoSession => "NO_SESSION",
            Self::Connect(_) => "CONNECT_FAILED",
            Self::ConnectTimeout(_) | Self::ReadyTimeout(_) => "TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::StaleGeneration { .. } => "STALE_SESSION",
            Self::Send(_) => "SEND_FAILED",
        };
        ErrorDetail::local("socket.io /accessories", code, self.to_string())
    }
}

/// A warm-up attempt failed on every path.
#[derive(Debug, Error)]
pub enum WarmError {
    #[error("no session token, skipping warm-up")]
    NoSession,

    #[error("accessory listing failed: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Errors that fail a whole `set_group_state` call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Light group with ID {0} does not exist")]
    UnknownGroup(String),
}
