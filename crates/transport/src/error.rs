//! Structured API errors

use serde::Deserialize;

/// Longest raw (non-JSON) error body kept as the message.
const MAX_RAW_MESSAGE: usize = 512;

/// Network-level failure category. Only `ConnectionRefused` and `Timeout` are
/// worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    Timeout,
    Other,
}

impl NetworkErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            NetworkErrorKind::ConnectionRefused => "connection_refused",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Non-2xx response from the service.
    #[error("{status} {status_text}: {message}")]
    Status {
        status: u16,
        status_text: String,
        /// Machine-readable error kind from the body (e.g. "Unauthorized").
        kind: Option<String>,
        message: String,
    },

    #[error("network error ({}): {message}", kind.label())]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// 2xx response we could not make sense of (missing result handle, bad JSON).
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// Request could not be built locally.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl ApiError {
    /// Build a status error from a rejected response.
    ///
    /// The body is expected to be `{"error": "...", "message": "..."}`. Anything
    /// else is kept as raw text (truncated); an empty body falls back to the
    /// status text.
    pub fn from_status(status: u16, status_text: &str, body: &[u8]) -> Self {
        let (kind, message) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) => (parsed.error, parsed.message),
            Err(_) => {
                let text = String::from_utf8_lossy(body);
                let text = text.trim();
                let raw = if text.is_empty() {
                    None
                } else {
                    Some(text.chars().take(MAX_RAW_MESSAGE).collect())
                };
                (None, raw)
            }
        };
        let message = message
            .or_else(|| kind.clone())
            .unwrap_or_else(|| status_text.to_string());
        ApiError::Status {
            status,
            status_text: status_text.to_string(),
            kind,
            message,
        }
    }

    /// HTTP status, if the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The most specific human-readable message available.
    pub fn message(&self) -> String {
        match self {
            ApiError::Status { message, .. } => message.clone(),
            ApiError::Network { message, .. } => message.clone(),
            ApiError::Protocol(msg) | ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::Cancelled => "request cancelled".to_string(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return ApiError::InvalidRequest(e.to_string());
        }
        let kind = if e.is_timeout() {
            NetworkErrorKind::Timeout
        } else if e.is_connect() {
            connect_failure_kind(&e)
        } else {
            NetworkErrorKind::Other
        };
        ApiError::Network {
            kind,
            message: e.to_string(),
        }
    }
}

/// DNS and TLS failures also surface as connect errors; only an actual
/// refusal or timeout from the socket counts as retryable.
fn connect_failure_kind(e: &(dyn std::error::Error + 'static)) -> NetworkErrorKind {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return NetworkErrorKind::ConnectionRefused;
                }
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                _ => {}
            }
        }
        source = err.source();
    }
    NetworkErrorKind::Other
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            _ => NetworkErrorKind::Other,
        };
        ApiError::Network {
            kind,
            message: e.to_string(),
        }
    }
}
