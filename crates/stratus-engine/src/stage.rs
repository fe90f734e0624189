//! Stage plans: the ordered, condition-gated steps of a resource's lifecycle

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use stratus_common::crd::{ConditionType, ReconcileState};
use stratus_common::Error;
use thiserror::Error;

/// Future returned by a stage action
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// A stage action borrows the scope mutably for the duration of the call
pub type StageAction<S> = for<'a> fn(&'a mut S) -> StageFuture<'a>;

/// The per-pass working set a controller hands to the engine.
///
/// Holds the mutable copy of the record plus whatever clients the stage
/// actions need. The engine only touches the reconcile state.
pub trait Staged: Send {
    type Condition: ConditionType;

    /// Short kind label used in metrics and logs
    const KIND: &'static str;

    fn state(&self) -> &ReconcileState<Self::Condition>;
    fn state_mut(&mut self) -> &mut ReconcileState<Self::Condition>;
}

/// When a stage runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Skipped once its condition is true
    Once,
    /// Runs on every pass; keeps drifting state in sync
    EveryPass,
}

pub struct Stage<S: Staged> {
    /// Condition the stage reports
    pub condition: S::Condition,
    pub action: StageAction<S>,
    /// Conditions that must be true before the action may run
    pub requires: &'static [S::Condition],
    pub gate: Gate,
    /// Reason recorded when the stage succeeds
    pub reason: &'static str,
}

impl<S: Staged> Stage<S> {
    /// A stage that runs until it succeeds once
    pub fn once(condition: S::Condition, reason: &'static str, action: StageAction<S>) -> Self {
        Self {
            condition,
            action,
            requires: &[],
            gate: Gate::Once,
            reason,
        }
    }

    /// A stage re-run on every pass
    pub fn every_pass(
        condition: S::Condition,
        reason: &'static str,
        action: StageAction<S>,
    ) -> Self {
        Self {
            gate: Gate::EveryPass,
            ..Self::once(condition, reason, action)
        }
    }

    pub fn requires(mut self, requires: &'static [S::Condition]) -> Self {
        self.requires = requires;
        self
    }
}

impl<S: Staged> fmt::Debug for Stage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("condition", &self.condition)
            .field("requires", &self.requires)
            .field("gate", &self.gate)
            .field("reason", &self.reason)
            .finish()
    }
}

/// A plan that failed validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("condition {0} appears in more than one stage")]
    DuplicateCondition(&'static str),

    #[error("the terminal condition {0} cannot be a stage")]
    TerminalStage(&'static str),

    #[error("stage {stage} requires {required}, which is not an earlier stage")]
    UnorderedRequirement {
        stage: &'static str,
        required: &'static str,
    },
}

impl From<PlanError> for Error {
    fn from(e: PlanError) -> Self {
        Error::internal_with_context("stage plan", e.to_string())
    }
}

/// Validated, ordered list of stages
pub struct StagePlan<S: Staged> {
    stages: Vec<Stage<S>>,
}

impl<S: Staged> fmt::Debug for StagePlan<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.stages).finish()
    }
}

impl<S: Staged> StagePlan<S> {
    /// Validate and build a plan.
    ///
    /// Conditions must be unique, the terminal Ready condition is never a
    /// stage, and every requirement names an earlier stage.
    pub fn new(stages: Vec<Stage<S>>) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.condition == S::Condition::READY {
                return Err(PlanError::TerminalStage(stage.condition.as_str()));
            }
            if let Some(required) = stage.requires.iter().find(|r| !seen.contains(*r)) {
                return Err(PlanError::UnorderedRequirement {
                    stage: stage.condition.as_str(),
                    required: required.as_str(),
                });
            }
            if !seen.insert(stage.condition) {
                return Err(PlanError::DuplicateCondition(stage.condition.as_str()));
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage<S>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
    )]
    pub enum Step {
        First,
        Second,
        Third,
        Ready,
    }

    impl ConditionType for Step {
        const READY: Self = Step::Ready;

        fn as_str(&self) -> &'static str {
            match self {
                Step::First => "First",
                Step::Second => "Second",
                Step::Third => "Third",
                Step::Ready => "Ready",
            }
        }
    }

    /// Scope whose stage outcomes are scripted per condition
    #[derive(Default)]
    pub struct Script {
        pub state: ReconcileState<Step>,
        pub calls: Vec<Step>,
        pub failures: std::collections::HashMap<Step, fn() -> Error>,
    }

    impl Script {
        pub fn run(&mut self, step: Step) -> Result<(), Error> {
            self.calls.push(step);
            match self.failures.get(&step) {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    impl Staged for Script {
        type Condition = Step;
        const KIND: &'static str = "test";

        fn state(&self) -> &ReconcileState<Step> {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ReconcileState<Step> {
            &mut self.state
        }
    }

    fn first(s: &mut Script) -> StageFuture<'_> {
        Box::pin(async move { s.run(Step::First) })
    }

    fn second(s: &mut Script) -> StageFuture<'_> {
        Box::pin(async move { s.run(Step::Second) })
    }

    fn third(s: &mut Script) -> StageFuture<'_> {
        Box::pin(async move { s.run(Step::Third) })
    }

    pub fn plan() -> StagePlan<Script> {
        StagePlan::new(vec![
            Stage::once(Step::First, "FirstDone", first),
            Stage::once(Step::Second, "SecondDone", second).requires(&[Step::First]),
            Stage::every_pass(Step::Third, "ThirdSynced", third).requires(&[Step::Second]),
        ])
        .unwrap()
    }

    #[test]
    fn valid_plan_keeps_order() {
        let plan = plan();
        let order: Vec<_> = plan.stages().iter().map(|s| s.condition).collect();
        assert_eq!(order, vec![Step::First, Step::Second, Step::Third]);
        assert_eq!(plan.stages()[2].gate, Gate::EveryPass);
    }

    #[test]
    fn duplicate_conditions_are_rejected() {
        let err = StagePlan::new(vec![
            Stage::once(Step::First, "a", first),
            Stage::once(Step::First, "b", second),
        ])
        .unwrap_err();
        assert_eq!(err, PlanError::DuplicateCondition("First"));
    }

    #[test]
    fn ready_is_never_a_stage() {
        let err = StagePlan::new(vec![Stage::once(Step::Ready, "a", first)]).unwrap_err();
        assert_eq!(err, PlanError::TerminalStage("Ready"));
    }

    #[test]
    fn requirements_must_come_earlier() {
        let err = StagePlan::new(vec![
            Stage::once(Step::First, "a", first).requires(&[Step::Second]),
            Stage::once(Step::Second, "b", second),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::UnorderedRequirement {
                stage: "First",
                required: "Second"
            }
        );

        // A stage cannot wait on itself either
        let err = StagePlan::new(vec![Stage::once(Step::First, "a", first).requires(&[Step::First])])
            .unwrap_err();
        assert!(matches!(err, PlanError::UnorderedRequirement { .. }));
    }
}
