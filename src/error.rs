use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::common::truncate_for_log;

/// Why a single lookup against the code API failed.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("malformed code {code:?}")]
    InvalidCode { code: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("status {status} from {url}: {}", truncate_for_log(.body))]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("invalid payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("{code} is not in the lookup cache and API access is disabled")]
    NotCached { code: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Client,
    Decode,
    Offline,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Client => "client",
            FailureKind::Decode => "decode",
            FailureKind::Offline => "offline",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LookupError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LookupError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            LookupError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else {
            LookupError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            LookupError::Timeout { .. } | LookupError::Transport { .. } => FailureKind::Transient,
            LookupError::Status { status, .. } if is_transient_status(*status) => {
                FailureKind::Transient
            }
            LookupError::Status { .. } | LookupError::InvalidCode { .. } => FailureKind::Client,
            LookupError::Decode { .. } => FailureKind::Decode,
            LookupError::NotCached { .. } => FailureKind::Offline,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LookupError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}
