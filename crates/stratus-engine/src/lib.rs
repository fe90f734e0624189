//! Convergence engine shared by the Stratus controllers
//!
//! A controller describes its resource as a [`StagePlan`]: an ordered list
//! of condition-gated stages run against a per-pass scope. [`converge`]
//! runs one pass of the plan, [`delete`] runs the deletion protocol, and
//! [`finish`] folds the result of persisting the scope into the pass
//! result. [`PassReport`] turns a finished pass into metrics and Events.
//! [`run_pass`] ties these together for a controller's [`Driver`].

mod converge;
mod delete;
mod outcome;
mod pass;
mod report;
mod stage;

pub use converge::{converge, converge_at};
pub use delete::{delete, delete_at, Teardown, DELETING_REASON};
pub use outcome::{finish, retry_delay, Outcome};
pub use pass::{run_pass, Driver, FINALIZER_REQUEUE};
pub use report::PassReport;
pub use stage::{Gate, PlanError, Stage, StageAction, StageFuture, StagePlan, Staged};
