//! Metrics and Events emitted at the end of every pass

use std::time::Instant;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use stratus_common::crd::{ConditionType, ReconcileState};
use stratus_common::events::{actions, reasons, EventPublisher};
use stratus_common::{metrics, Error};

use crate::delete::DELETING_REASON;
use crate::outcome::Outcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Converge { was_ready: bool },
    Delete { first_pass: bool },
}

/// Captures the pre-pass state needed to report what a pass changed
pub struct PassReport {
    kind: &'static str,
    resource: ObjectReference,
    mode: Mode,
    started: Instant,
}

impl PassReport {
    /// Start reporting a convergence pass
    pub fn converge<C: ConditionType>(
        kind: &'static str,
        resource: ObjectReference,
        state: &ReconcileState<C>,
    ) -> Self {
        Self {
            kind,
            resource,
            mode: Mode::Converge {
                was_ready: state.ready,
            },
            started: Instant::now(),
        }
    }

    /// Start reporting a deletion pass
    pub fn delete<C: ConditionType>(
        kind: &'static str,
        resource: ObjectReference,
        state: &ReconcileState<C>,
    ) -> Self {
        let first_pass = !state
            .conditions
            .get(C::READY)
            .is_some_and(|c| c.reason == DELETING_REASON);
        Self {
            kind,
            resource,
            mode: Mode::Delete { first_pass },
            started: Instant::now(),
        }
    }

    /// Record metrics and publish the Events the pass warrants
    pub async fn finish(
        self,
        events: &dyn EventPublisher,
        now_ready: bool,
        result: &Result<Outcome, Error>,
    ) {
        let label = match result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::record_reconcile(self.kind, label, self.started.elapsed());

        if let Err(e) = result {
            metrics::record_error(self.kind, e.failure_reason(), e.is_retryable());
        }

        for (type_, reason, action, note) in self.events(now_ready, result) {
            events
                .publish(&self.resource, type_, reason, action, note)
                .await;
        }
    }

    fn events(
        &self,
        now_ready: bool,
        result: &Result<Outcome, Error>,
    ) -> Vec<(EventType, &'static str, &'static str, Option<String>)> {
        let mut out = Vec::new();
        match self.mode {
            Mode::Converge { was_ready } => match result {
                Err(e) if !e.is_retryable() => out.push((
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )),
                Ok(_) if now_ready && !was_ready => {
                    out.push((EventType::Normal, reasons::READY, actions::RECONCILE, None))
                }
                _ => {}
            },
            Mode::Delete { first_pass } => {
                if first_pass {
                    out.push((
                        EventType::Normal,
                        reasons::DELETION_STARTED,
                        actions::DELETE,
                        None,
                    ));
                }
                match result {
                    Ok(Outcome::Done) => {
                        out.push((EventType::Normal, reasons::DELETED, actions::DELETE, None))
                    }
                    Err(e) => out.push((
                        EventType::Warning,
                        reasons::DELETION_BLOCKED,
                        actions::DELETE,
                        Some(e.to_string()),
                    )),
                    Ok(Outcome::RequeueAfter(_)) => {}
                }
            }
        }
        out
    }
}
