use std::time::Duration;

/// Failure of the wrapped model call itself.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Outcome of a call rejected or failed by the resilience guard.
///
/// `CircuitOpen` and `RateExceeded` are expected rejections: the wrapped
/// operation was never invoked. `Upstream` carries the operation's own error
/// and counts toward the circuit.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    #[error("rate limit exceeded")]
    RateExceeded,
    #[error("upstream call failed: {0}")]
    Upstream(#[source] E),
}

impl<E> GuardError<E> {
    /// True when the guard refused the call without invoking it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateExceeded)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateExceeded => "rate_exceeded",
            Self::Upstream(_) => "upstream",
        }
    }

    /// Text shown to the user. Upstream failures are retried by the caller
    /// and never surfaced as errors.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::CircuitOpen { .. } | Self::RateExceeded => Some("service busy, retry shortly"),
            Self::Upstream(_) => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid or unreadable configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
