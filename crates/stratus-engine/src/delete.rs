//! Finalizer-protected deletion

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratus_common::crd::ConditionType;
use stratus_common::{metrics, Error, StageTimings};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::outcome::{retry_delay, Outcome};
use crate::stage::Staged;

/// Reason of the Ready condition while deletion is in progress
pub const DELETING_REASON: &str = "Deleting";

/// Kind-specific hooks of the deletion protocol
#[async_trait]
pub trait Teardown: Staged {
    /// Whether the engine finalizer is still on the record
    fn has_finalizer(&self) -> bool;

    /// When deletion was requested
    fn deletion_requested_at(&self) -> Option<DateTime<Utc>>;

    /// Names of live objects that still depend on this one
    async fn live_dependents(&mut self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    /// Delete the cloud object. Not-found counts as done.
    async fn teardown(&mut self) -> Result<(), Error>;

    /// Release finalizers this record holds on other objects
    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Remove the engine finalizer from the record
    async fn release_finalizer(&mut self) -> Result<(), Error>;
}

/// Run the deletion protocol.
///
/// Dependents block first, then the cloud object is torn down, then
/// auxiliary finalizers are released and the engine finalizer goes last.
/// Any failure keeps the finalizer; retryable failures requeue until the
/// deletion has been pending longer than the stale timeout.
pub async fn delete<S: Teardown>(scope: &mut S, timings: &StageTimings) -> Result<Outcome, Error> {
    delete_at(scope, timings, Utc::now()).await
}

/// [`delete`] with an explicit wall clock
pub async fn delete_at<S: Teardown>(
    scope: &mut S,
    timings: &StageTimings,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    if !scope.has_finalizer() {
        debug!(kind = S::KIND, "Finalizer already released");
        return Ok(Outcome::Done);
    }
    scope.state_mut().clear_failure();

    let deadline = Instant::now() + timings.pass_timeout;
    let result = match timeout_at(deadline, release_all(scope)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: "deletion".to_string(),
            after: timings.pass_timeout,
        }),
    };

    let Err(error) = result else {
        info!(kind = S::KIND, "Deletion complete");
        return Ok(Outcome::Done);
    };

    let reason = error.failure_reason();
    let message = error.to_string();
    let state = scope.state_mut();
    state.ready = false;
    state
        .conditions
        .set_false(S::Condition::READY, DELETING_REASON, &message, now);

    if !error.is_retryable() {
        warn!(kind = S::KIND, error = %message, "Deletion failed terminally");
        state.set_failure(reason, &message);
        return Err(error);
    }

    let pending_since = scope.deletion_requested_at().unwrap_or(now);
    let pending_for = (now - pending_since).to_std().unwrap_or_default();
    if pending_for > timings.stale_timeout {
        let stale = Error::Stale {
            condition: "Deletion".to_string(),
            stale_after: timings.stale_timeout,
            last_error: message,
            last_reason: reason,
        };
        warn!(kind = S::KIND, error = %stale, "Deletion went stale");
        metrics::record_stage(S::KIND, "Deletion", "terminal");
        scope
            .state_mut()
            .set_failure(stale.failure_reason(), stale.to_string());
        return Err(stale);
    }

    let delay = retry_delay(&error, timings);
    debug!(kind = S::KIND, error = %message, delay_secs = delay.as_secs(), "Deletion pending");
    metrics::record_stage(S::KIND, "Deletion", "retry");
    Ok(Outcome::RequeueAfter(delay))
}

async fn release_all<S: Teardown>(scope: &mut S) -> Result<(), Error> {
    let dependents = scope.live_dependents().await?;
    if !dependents.is_empty() {
        return Err(Error::dependents_remain(&dependents));
    }

    match scope.teardown().await {
        Err(e) if e.is_not_found() => debug!(kind = S::KIND, "Cloud object already gone"),
        other => other?,
    }

    scope.release_auxiliary().await?;
    scope.release_finalizer().await
}
