//! One convergence pass over a stage plan

use std::time::Duration;

use chrono::{DateTime, Utc};
use stratus_common::crd::{ConditionType, ReconcileState};
use stratus_common::{metrics, Error, StageTimings};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::outcome::{retry_delay, Outcome};
use crate::stage::{Gate, Stage, StagePlan, Staged};

/// Run one pass of `plan` against `scope`.
///
/// Stages run in order. The first failing stage ends the pass: retryable
/// failures requeue until their condition has been false for longer than
/// the stale timeout, then escalate. The caller persists the scope
/// whatever this returns.
pub async fn converge<S: Staged>(
    plan: &StagePlan<S>,
    scope: &mut S,
    timings: &StageTimings,
) -> Result<Outcome, Error> {
    converge_at(plan, scope, timings, Utc::now()).await
}

/// [`converge`] with an explicit wall clock for condition timestamps
pub async fn converge_at<S: Staged>(
    plan: &StagePlan<S>,
    scope: &mut S,
    timings: &StageTimings,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    scope.state_mut().clear_failure();
    let deadline = Instant::now() + timings.pass_timeout;

    for stage in plan.stages() {
        let condition = stage.condition;
        if stage.gate == Gate::Once && scope.state().conditions.is_true(condition) {
            continue;
        }

        let result = match stage
            .requires
            .iter()
            .find(|r| !scope.state().conditions.is_true(**r))
        {
            Some(missing) => Err(Error::not_ready(format!(
                "{} is waiting for {}",
                condition.as_str(),
                missing.as_str()
            ))),
            None => run_stage(stage, scope, deadline, timings.pass_timeout).await,
        };

        match result {
            Ok(()) => {
                debug!(kind = S::KIND, stage = condition.as_str(), "Stage complete");
                metrics::record_stage(S::KIND, condition.as_str(), "success");
                scope
                    .state_mut()
                    .conditions
                    .set_true(condition, stage.reason, now);
            }
            Err(e) => return escalate(S::KIND, scope.state_mut(), condition, e, timings, now),
        }
    }

    let state = scope.state_mut();
    state.conditions.set_true(S::Condition::READY, "Ready", now);
    state.ready = true;
    Ok(Outcome::Done)
}

async fn run_stage<S: Staged>(
    stage: &Stage<S>,
    scope: &mut S,
    deadline: Instant,
    pass_timeout: Duration,
) -> Result<(), Error> {
    match timeout_at(deadline, (stage.action)(scope)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: stage.condition.as_str().to_string(),
            after: pass_timeout,
        }),
    }
}

/// Record a failed stage and decide between requeue and terminal failure.
///
/// A failure on the Ready condition itself comes from before the first
/// stage and is recorded on Ready alone.
pub(crate) fn escalate<C: ConditionType>(
    kind: &'static str,
    state: &mut ReconcileState<C>,
    condition: C,
    error: Error,
    timings: &StageTimings,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let reason = error.failure_reason();
    let message = error.to_string();

    state.conditions.set_false(condition, reason, &message, now);
    state.ready = false;
    if condition != C::READY {
        state.conditions.set_false(
            C::READY,
            "Reconciling",
            format!("{} is not complete", condition.as_str()),
            now,
        );
    }

    if !error.is_retryable() {
        warn!(kind, stage = condition.as_str(), error = %message, "Stage failed terminally");
        metrics::record_stage(kind, condition.as_str(), "terminal");
        state.set_failure(reason, &message);
        return Err(error);
    }

    // set_false kept the original transition time if it was already false
    let false_since = state.conditions.false_since(condition).unwrap_or(now);
    let false_for = (now - false_since).to_std().unwrap_or_default();
    if false_for > timings.stale_timeout {
        let stale = Error::Stale {
            condition: condition.as_str().to_string(),
            stale_after: timings.stale_timeout,
            last_error: message,
            last_reason: reason,
        };
        warn!(kind, stage = condition.as_str(), error = %stale, "Stage went stale");
        metrics::record_stage(kind, condition.as_str(), "terminal");
        state.set_failure(stale.failure_reason(), stale.to_string());
        return Err(stale);
    }

    let delay = retry_delay(&error, timings);
    debug!(
        kind,
        stage = condition.as_str(),
        error = %message,
        delay_secs = delay.as_secs(),
        "Stage not complete, requeueing"
    );
    metrics::record_stage(kind, condition.as_str(), "retry");
    Ok(Outcome::RequeueAfter(delay))
}
