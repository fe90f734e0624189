//! Error types for Stratus controllers
//!
//! Every error knows whether retrying may help ([`Error::is_retryable`])
//! and which stable reason string to persist when it ends a reconcile
//! ([`Error::failure_reason`]). Stage actions return these raw; only the
//! convergence engine decides between requeue and terminal failure.

use std::time::Duration;

use stratus_cloud::CloudError;
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Stratus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud API error
    #[error("cloud API error: {source}")]
    Cloud {
        /// The underlying client error
        #[from]
        source: CloudError,
    },

    /// The declared spec cannot be acted on
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the offending object
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.vpcRef")
        field: Option<String>,
    },

    /// Something this resource depends on is not ready yet
    #[error("{message}")]
    NotReady {
        /// What is being waited for
        message: String,
        /// Earliest useful retry, if known
        retry_after: Option<Duration>,
    },

    /// The result would exceed a cloud API count limit
    #[error("{what}: {count} exceeds the limit of {limit}")]
    Cardinality {
        /// What was counted
        what: String,
        /// How many were produced
        count: usize,
        /// The API ceiling
        limit: usize,
    },

    /// Deletion is blocked by objects that still use this resource
    #[error("deletion blocked by {count} dependent(s): {dependents}")]
    DependentsRemain {
        /// Number of live dependents
        count: usize,
        /// Short listing of the dependents
        dependents: String,
    },

    /// A stage did not finish before the pass deadline
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        /// What was running
        operation: String,
        /// The deadline that elapsed
        after: Duration,
    },

    /// A retryable failure persisted past the stale timeout
    #[error("{condition} has been failing for more than {}s: {last_error}", stale_after.as_secs())]
    Stale {
        /// The condition that never became true
        condition: String,
        /// The configured stale timeout
        stale_after: Duration,
        /// The most recent underlying failure
        last_error: String,
        /// Reason of the most recent underlying failure
        last_reason: &'static str,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "credentials")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named object and field
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-ready error without a retry hint
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady {
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Create a not-ready error that should not be retried before `after`
    pub fn not_ready_for(msg: impl Into<String>, after: Duration) -> Self {
        Self::NotReady {
            message: msg.into(),
            retry_after: Some(after),
        }
    }

    /// Create a cardinality error
    pub fn cardinality(what: impl Into<String>, count: usize, limit: usize) -> Self {
        Self::Cardinality {
            what: what.into(),
            count,
            limit,
        }
    }

    /// Create a dependents-remain error from the dependents' names
    pub fn dependents_remain(names: &[String]) -> Self {
        const SHOWN: usize = 5;
        let mut dependents = names.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
        if names.len() > SHOWN {
            dependents.push_str(&format!(" and {} more", names.len() - SHOWN));
        }
        Self::DependentsRemain {
            count: names.len(),
            dependents,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Conflicts resolve on the next read; other 4xx won't
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Cloud { source } => source.is_retryable(),
            Error::Validation { .. } => false,
            Error::NotReady { .. } => true,
            Error::Cardinality { .. } => false,
            Error::DependentsRemain { .. } => true,
            Error::Timeout { .. } => true,
            Error::Stale { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Minimum delay before a retry makes sense, when the error says so
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Cloud { source } => source.retry_after(),
            Error::NotReady { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True when the error says a cloud object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Cloud { source } if source.is_not_found())
    }

    /// Stable reason persisted as `status.failureReason` and used as the
    /// reason of a false condition
    pub fn failure_reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesApiError",
            Error::Cloud { source } => match source {
                CloudError::NotFound { .. } => "CloudResourceNotFound",
                CloudError::RateLimited { .. } => "RateLimited",
                _ => "CloudApiError",
            },
            Error::Validation { .. } => "InvalidConfiguration",
            Error::NotReady { .. } => "DependencyNotReady",
            Error::Cardinality { .. } => "RuleLimitExceeded",
            Error::DependentsRemain { .. } => "DeletionBlocked",
            Error::Timeout { .. } => "Timeout",
            Error::Stale { .. } => "StaleCondition",
            Error::Serialization { .. } => "SerializationError",
            Error::Internal { .. } => "InternalError",
        }
    }
}
