use std::{fmt, time::Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle states shared by batches and games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Configured but not started.
    Created,
    /// In progress.
    Running,
    /// Temporarily halted; timers are frozen.
    Paused,
    /// Completed normally.
    Ended,
    /// Stopped by an operator.
    Terminated,
    /// Stopped because of an error.
    Failed,
}

impl LifecycleState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Ended | LifecycleState::Terminated | LifecycleState::Failed
        )
    }

    /// Value stored in the `status` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Ended => "ended",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Failed => "failed",
        }
    }

    /// Parse a `status` attribute value.
    pub fn from_status(raw: &str) -> Option<Self> {
        [
            LifecycleState::Created,
            LifecycleState::Running,
            LifecycleState::Paused,
            LifecycleState::Ended,
            LifecycleState::Terminated,
            LifecycleState::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == raw)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can be applied to a lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Begin running.
    Start,
    /// Freeze a running scope.
    Pause,
    /// Continue after a pause.
    Resume,
    /// Finish normally.
    End,
    /// Stop on operator request.
    Terminate,
    /// Stop because of an error.
    Fail,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from}")]
pub struct InvalidTransition {
    /// The state the machine was in when the invalid event was received.
    pub from: LifecycleState,
    /// The event that cannot be applied from this state.
    pub event: LifecycleEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    #[error("a transition is already pending")]
    AlreadyPending,
    /// The requested transition is not valid from the current state.
    #[error(transparent)]
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// State changed since the plan was created.
    #[error("state changed from {expected} to {actual} since planning")]
    StateMismatch {
        /// State when plan was created.
        expected: LifecycleState,
        /// Current state.
        actual: LifecycleState,
    },
    /// Version changed since the plan was created.
    #[error("version changed from {expected} to {actual} since planning")]
    VersionMismatch {
        /// Version when plan was created.
        expected: usize,
        /// Current version.
        actual: usize,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// State the machine is currently in.
    pub from: LifecycleState,
    /// State the machine will transition to.
    pub to: LifecycleState,
    /// Event that triggered this transition.
    pub event: LifecycleEvent,
    /// Version number after applying this transition.
    pub version_next: usize,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current state.
    pub state: LifecycleState,
    /// Version number (increments on each transition).
    pub version: usize,
    /// Pending target state, if a transition is planned but not yet applied.
    pub pending: Option<LifecycleState>,
}

/// Monotonic lifecycle machine for one batch or game.
///
/// Once a terminal state is reached every further event is rejected, which is
/// what keeps late timer expiries and duplicate operator requests harmless.
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    state: LifecycleState,
    version: usize,
    pending: Option<Plan>,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::resume_from(LifecycleState::Created)
    }
}

impl LifecycleMachine {
    /// Create a machine in the created state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a machine from a persisted status.
    pub fn resume_from(state: LifecycleState) -> Self {
        Self {
            state,
            version: 0,
            pending: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Version counter, bumped on every applied transition.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Plan a transition by validating that the event can be applied from the current state.
    /// Returns a Plan that can later be applied or aborted.
    pub fn plan(&mut self, event: LifecycleEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.state,
            to: next,
            event,
            version_next: self.version + 1,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new state.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<LifecycleState, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.state != plan.from {
            return Err(ApplyError::StateMismatch {
                expected: plan.from,
                actual: self.state,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        self.state = plan.to;
        self.version = plan.version_next;

        Ok(self.state)
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Plan and apply in one step when no side effects need to be staged in between.
    pub fn fire(&mut self, event: LifecycleEvent) -> Result<LifecycleState, PlanError> {
        let plan = self.plan(event)?;
        self.state = plan.to;
        self.version = plan.version_next;
        self.pending = None;
        Ok(self.state)
    }

    fn compute_transition(&self, event: LifecycleEvent) -> Result<LifecycleState, InvalidTransition> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        let next = match (self.state, event) {
            (S::Created, E::Start) => S::Running,
            (S::Running, E::Pause) => S::Paused,
            (S::Paused, E::Resume) => S::Running,
            (S::Running, E::End) => S::Ended,
            (S::Created | S::Running | S::Paused, E::Terminate) => S::Terminated,
            (S::Created | S::Running | S::Paused, E::Fail) => S::Failed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
