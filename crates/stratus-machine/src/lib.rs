//! StratusMachine controller: one compute instance per machine

pub mod controller;
pub mod store;

pub use controller::{error_policy, machine_plan, reconcile, Context, KIND};
pub use store::{KubeMachineStore, MachineStore};
