//! One reconcile pass, from finalizer to persisted status

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::Resource;
use stratus_common::crd::{ConditionType, ReconcileState};
use stratus_common::events::EventPublisher;
use stratus_common::kube_utils::has_finalizer;
use stratus_common::{Error, StageTimings, STRATUS_FINALIZER};
use tracing::{debug, info};

use crate::converge::{converge, escalate};
use crate::delete::{delete, Teardown};
use crate::outcome::finish;
use crate::report::PassReport;
use crate::stage::{StagePlan, Staged};

/// Requeue after the finalizer is added, so the next pass sees it
pub const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

type ConditionOf<D> = <<D as Driver>::Scope as Staged>::Condition;

/// What a controller plugs into [`run_pass`]: how to open a scope for a
/// record, and how to write the record back.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Record: Resource<DynamicType = ()> + Clone + Send + Sync + 'static;
    type Scope: Teardown;

    fn timings(&self) -> &StageTimings;

    /// Requeue interval of a converged record
    fn resync_interval(&self) -> Duration;

    fn events(&self) -> &dyn EventPublisher;

    fn plan(&self) -> Result<StagePlan<Self::Scope>, Error>;

    /// Reconcile state on the record, inserting an empty status if needed
    fn state_of(record: &mut Self::Record) -> &mut ReconcileState<ConditionOf<Self>>;

    async fn add_finalizer(&self, record: &Self::Record) -> Result<(), Error>;

    /// Pin the objects the record depends on, such as its credentials
    /// Secret. Runs on every pass that is not a deletion.
    async fn retain(&self, record: &Self::Record) -> Result<(), Error>;

    /// Resolve credentials and build the working copy for one pass
    async fn open(self: Arc<Self>, record: &Self::Record) -> Result<Self::Scope, Error>;

    /// The record as the pass left it
    fn close(scope: Self::Scope) -> Self::Record;

    async fn persist(&self, original: &Self::Record, updated: &Self::Record)
        -> Result<(), Error>;
}

/// Run one pass over `record`.
///
/// The first pass only adds the engine finalizer. Later passes open a
/// scope and run either the deletion protocol or the plan. A failure to
/// open the scope is recorded on the Ready condition with the same
/// escalation rules as a failed stage. The record is persisted once,
/// whatever happened.
pub async fn run_pass<D: Driver>(record: Arc<D::Record>, ctx: Arc<D>) -> Result<Action, Error> {
    let kind = <D::Scope as Staged>::KIND;
    let deleting = record.meta().deletion_timestamp.is_some();
    let finalized = has_finalizer(record.as_ref(), STRATUS_FINALIZER);

    if !finalized {
        if deleting {
            debug!(kind, "Finalizer already released");
            return Ok(Action::await_change());
        }
        info!(kind, "Adding finalizer");
        ctx.add_finalizer(&record).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let timings = ctx.timings();
    let mut updated = (*record).clone();
    let report = {
        let resource = record.object_ref(&());
        let state = D::state_of(&mut updated);
        if deleting {
            PassReport::delete(kind, resource, state)
        } else {
            PassReport::converge(kind, resource, state)
        }
    };

    let result = match open(&ctx, &record, deleting).await {
        Ok(mut scope) => {
            let result = if deleting {
                delete(&mut scope, timings).await
            } else {
                match ctx.plan() {
                    Ok(plan) => converge(&plan, &mut scope, timings).await,
                    Err(e) => Err(e),
                }
            };
            updated = D::close(scope);
            result
        }
        Err(e) => {
            let state = D::state_of(&mut updated);
            state.clear_failure();
            let condition = <ConditionOf<D> as ConditionType>::READY;
            escalate(kind, state, condition, e, timings, Utc::now())
        }
    };

    let ready = D::state_of(&mut updated).ready;
    let result = finish(result, ctx.persist(&record, &updated).await);
    report.finish(ctx.events(), ready, &result).await;

    let resync = (!deleting).then(|| ctx.resync_interval());
    Ok(result?.into_action(resync))
}

async fn open<D: Driver>(
    ctx: &Arc<D>,
    record: &D::Record,
    deleting: bool,
) -> Result<D::Scope, Error> {
    let scope = ctx.clone().open(record).await?;
    if !deleting {
        ctx.retain(record).await?;
    }
    Ok(scope)
}
