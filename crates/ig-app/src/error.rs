use std::time::Duration;

use thiserror::Error;

/// Failures at the model-serving boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend call timed out after {0}s")]
    Timeout(u64),

    #[error("Backend is rate limiting (HTTP {0})")]
    RateLimited(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed request or response: {0}")]
    Malformed(String),

    #[error("Model crashed: {0}")]
    ModelCrash(String),

    #[error("Backend returned no image")]
    EmptyResponse,
}

impl BackendError {
    /// Maps a non-success status to the error it stands for.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited(status),
            408 | 502 | 503 | 504 => Self::Http { status, body },
            500 => Self::ModelCrash(body),
            400..=499 => Self::Malformed(format!("HTTP {status}: {body}")),
            _ => Self::Http { status, body },
        }
    }

    /// Worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 502 | 503 | 504),
            Self::Malformed(_) | Self::ModelCrash(_) | Self::EmptyResponse => false,
        }
    }
}

impl BackendError {
    /// Classify a client error. `timeout` is the limit the request ran under.
    pub fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout.as_secs())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}
