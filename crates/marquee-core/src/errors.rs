use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed error for every call that leaves the process (language model,
/// catalog services). Classified by [`ErrorClassifier`] before any retry.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("request rejected {status}: {body}")]
    Client { status: u16, body: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            400..=499 => Self::Client { status, body },
            500..=599 => Self::Server { status, body },
            _ => Self::InvalidResponse(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failures while turning free text into structured intent.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ParseError {
    #[error("model call failed: {0}")]
    Model(#[from] ServiceError),
    #[error("nothing specified")]
    NotSpecified,
    #[error("unknown selection type: {0}")]
    UnknownSelectionType(String),
    #[error("schema violation: {0}")]
    Schema(String),
}

/// Failures of a pending-context backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("context store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Server,
    Client,
    Auth,
    NotFound,
    CircuitOpen,
    InvalidResponse,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Client => "client",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidResponse => "invalid_response",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Verdict on a raw error. Consumed by the resilience layer only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassifiedError {
    pub is_retryable: bool,
    pub category: ErrorCategory,
    pub severity: Severity,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &ServiceError) -> ClassifiedError;
}

/// Variant-driven classification, with message sniffing for `Other`.
#[derive(Clone, Debug)]
pub struct DefaultClassifier {
    transient_patterns: Vec<&'static str>,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self {
            transient_patterns: vec![
                "timeout",
                "timed out",
                "connection reset",
                "connection refused",
                "broken pipe",
                "temporarily unavailable",
                "service unavailable",
                "bad gateway",
                "502",
                "503",
                "504",
                "rate limit",
                "too many requests",
            ],
        }
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &ServiceError) -> ClassifiedError {
        use ErrorCategory as C;
        use Severity as S;

        let (is_retryable, category, severity) = match error {
            ServiceError::Network(_) => (true, C::Network, S::Medium),
            ServiceError::Timeout(_) => (true, C::Timeout, S::Medium),
            ServiceError::RateLimited { .. } => (true, C::RateLimit, S::Low),
            ServiceError::Server { .. } => (true, C::Server, S::High),
            ServiceError::Client { .. } => (false, C::Client, S::Medium),
            ServiceError::Unauthorized(_) => (false, C::Auth, S::Critical),
            ServiceError::NotFound(_) => (false, C::NotFound, S::Low),
            ServiceError::InvalidResponse(_) => (false, C::InvalidResponse, S::Medium),
            ServiceError::CircuitOpen { .. } => (false, C::CircuitOpen, S::High),
            ServiceError::Other(msg) => {
                let lower = msg.to_lowercase();
                if self.transient_patterns.iter().any(|p| lower.contains(p)) {
                    (true, C::Network, S::Medium)
                } else {
                    (false, C::Unknown, S::Medium)
                }
            }
        };

        ClassifiedError {
            is_retryable,
            category,
            severity,
        }
    }
}
