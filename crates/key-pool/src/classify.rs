//! Failure classification for API requests
//!
//! Maps a failed request to what the retry loop should do next. Credential
//! problems (401/403/429) rotate to another key immediately; task problems
//! (other 4xx) stop the task; transient trouble retries after a linear
//! backoff.

use std::time::Duration;

use serde::Serialize;
use transport::{ApiError, NetworkErrorKind};

/// User-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthExpired,
    QuotaExceeded,
    ClientError,
    ServerError,
    NetworkError,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
        }
    }

    /// Whether the failure says something about the credential itself.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, ErrorKind::AuthExpired | ErrorKind::QuotaExceeded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Next step for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Disable the credential and move to another one without waiting.
    Rotate,
    /// Back off, then try the same credential again.
    RetrySame,
    /// Back off, then try whichever credential selection returns.
    RetryAny,
    /// Give up on the task.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub decision: RetryDecision,
    pub message: String,
}

/// Classify a failed request.
pub fn classify(error: &ApiError) -> Classification {
    let (kind, decision) = match error {
        ApiError::Status { status, .. } => classify_status(*status),
        ApiError::Network { kind, .. } => match kind {
            NetworkErrorKind::ConnectionRefused | NetworkErrorKind::Timeout => {
                (ErrorKind::NetworkError, RetryDecision::RetryAny)
            }
            NetworkErrorKind::Other => (ErrorKind::NetworkError, RetryDecision::Fail),
        },
        // A 2xx we could not use is the server's fault.
        ApiError::Protocol(_) => (ErrorKind::ServerError, RetryDecision::RetrySame),
        ApiError::InvalidRequest(_) => (ErrorKind::ClientError, RetryDecision::Fail),
        // Callers check cancellation before classifying; never retry it.
        ApiError::Cancelled => (ErrorKind::ClientError, RetryDecision::Fail),
    };
    Classification {
        kind,
        decision,
        message: user_message(kind, error),
    }
}

/// Classify by HTTP status alone.
///
/// 401/403 are dead credentials, 429 is a spent quota, other 4xx are the
/// task's fault and 5xx are transient.
pub fn classify_status(status: u16) -> (ErrorKind, RetryDecision) {
    match status {
        401 | 403 => (ErrorKind::AuthExpired, RetryDecision::Rotate),
        429 => (ErrorKind::QuotaExceeded, RetryDecision::Rotate),
        400..=499 => (ErrorKind::ClientError, RetryDecision::Fail),
        500..=599 => (ErrorKind::ServerError, RetryDecision::RetrySame),
        // 1xx/3xx reaching here means the response was not handled.
        _ => (ErrorKind::ServerError, RetryDecision::RetrySame),
    }
}

/// Linear backoff: `base × (attempt + 1)` for 0-based attempts.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt.saturating_add(1))
        .unwrap_or(Duration::MAX)
}

fn user_message(kind: ErrorKind, error: &ApiError) -> String {
    let detail = error.message();
    match kind {
        ErrorKind::AuthExpired => format!("API key rejected: {detail}"),
        ErrorKind::QuotaExceeded => format!("API key over its limit: {detail}"),
        ErrorKind::ClientError => detail,
        ErrorKind::ServerError => format!("service error: {detail}"),
        ErrorKind::NetworkError => format!("network error: {detail}"),
    }
}
