//! Common types for Stratus: CRDs, errors, configuration and utilities

pub mod config;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use config::{ControllerConfig, StageTimings, FIELD_MANAGER};
pub use credentials::{CloudAccess, KubeSecretStore, SecretStore};
#[cfg(any(test, feature = "mock"))]
pub use credentials::MockSecretStore;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer every Stratus controller places on the objects it manages
pub const STRATUS_FINALIZER: &str = "infrastructure.stratus.dev/finalizer";

/// Tag added to every cloud object the operator creates
pub const MANAGED_TAG: &str = "managed-by:stratus";
