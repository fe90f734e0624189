//! Stratus operator: runs the infrastructure controllers of the
//! infrastructure.stratus.dev API group

pub mod controller_runner;
pub mod settings;

pub use controller_runner::{build_all, ControllerFuture, Shared};
pub use settings::ControllerArgs;
