//! What a pass asks the controller runtime to do next

use std::time::Duration;

use kube::runtime::controller::Action;
use stratus_common::{Error, StageTimings};
use tracing::warn;

/// Result of a pass that did not fail terminally
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage is complete
    Done,
    /// Work remains; try again after the delay
    RequeueAfter(Duration),
}

impl Outcome {
    /// Map to a controller action. A finished resource is revisited after
    /// `resync` to catch drift, if one is given.
    pub fn into_action(self, resync: Option<Duration>) -> Action {
        match (self, resync) {
            (Outcome::RequeueAfter(delay), _) => Action::requeue(delay),
            (Outcome::Done, Some(resync)) => Action::requeue(resync),
            (Outcome::Done, None) => Action::await_change(),
        }
    }

    /// Label used for the reconcile duration metric
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::RequeueAfter(_) => "requeue",
        }
    }
}

/// Delay before retrying after `error`: the kind's retry delay, or the
/// error's own hint when that is longer
pub fn retry_delay(error: &Error, timings: &StageTimings) -> Duration {
    error
        .retry_after()
        .map_or(timings.retry_delay, |hint| hint.max(timings.retry_delay))
}

/// Fold the persist result into the pass result.
///
/// The pass error wins over a persist error; a persist failure after a
/// successful pass becomes the pass error so the runtime retries.
pub fn finish(
    result: Result<Outcome, Error>,
    persisted: Result<(), Error>,
) -> Result<Outcome, Error> {
    match (result, persisted) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(persist_error)) => {
            warn!(error = %persist_error, "Failed to persist status of a failed pass");
            Err(e)
        }
    }
}
