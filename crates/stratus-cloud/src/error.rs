//! Errors returned by the cloud API client

use std::time::Duration;

use thiserror::Error;

/// Error from a call to the cloud API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The addressed object does not exist
    #[error("{resource} not found")]
    NotFound {
        /// Path of the missing object (e.g. "instances/42")
        resource: String,
    },

    /// The API refused the request because a rate limit was hit
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// How long the API asked us to wait
        retry_after: Duration,
    },

    /// Any other non-success HTTP status
    #[error("cloud API returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error reasons reported by the API
        message: String,
    },

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete in time
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl CloudError {
    /// Create a not-found error for the given object path
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an API error with the given status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// True when the object addressed by the request does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    /// Whether repeating the same request later may succeed
    ///
    /// Throttling, server-side failures and transport problems are
    /// transient. Client errors (bad input, missing permissions) and
    /// undecodable responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::NotFound { .. } => false,
            CloudError::RateLimited { .. } => true,
            CloudError::Api { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            CloudError::Transport(_) | CloudError::Timeout(_) => true,
            CloudError::Decode(_) => false,
        }
    }

    /// Minimum delay the API asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CloudError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CloudError::Timeout(e.to_string())
        } else if e.is_decode() {
            CloudError::Decode(e.to_string())
        } else {
            CloudError::Transport(e.to_string())
        }
    }
}
