//! Client for the Stratus cloud API.
//!
//! [`CloudClient`] is the seam controllers program against; [`HttpCloudClient`]
//! talks to the real API and [`HttpConnector`] hands out one client per set of
//! credentials, wired to that account's [`AdmissionLimiter`].

pub mod client;
pub mod credentials;
pub mod error;
pub mod http;
pub mod limiter;
pub mod types;

pub use client::{CloudClient, CloudConnector, CloudResult};
#[cfg(any(test, feature = "mock"))]
pub use client::{MockCloudClient, MockCloudConnector};
pub use credentials::Credentials;
pub use error::CloudError;
pub use http::{HttpCloudClient, HttpConnector, ResponseObserver, DEFAULT_API_URL};
pub use limiter::{AdmissionLimiter, LimiterConfig, LimiterRegistry, SharedLimiter};
