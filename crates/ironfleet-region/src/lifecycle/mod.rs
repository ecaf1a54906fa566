//! Machine Lifecycle Engine
//!
//! Drives each machine through commissioning, testing, allocation,
//! deployment and release by dispatching steps to the rack that serves the
//! machine's segment.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  Execute   ┌──────────────┐  StepOrder  ┌────────────┐
//! │ LifecycleEngine  │──────────▶│ MachineActor │────────────▶│ StepRunner │
//! │ (registry)       │            │ (one/machine)│◀────────────│ (task)     │
//! └──────────────────┘            └──────────────┘ StepFinished└────────────┘
//!                                        │                          │
//!                                        ▼                          ▼
//!                                  Store (record)          RackRouter → rack
//! ```
//!
//! Every state change is written to the store before the actor handles its
//! next message. A region restart reloads the records and resumes whatever
//! step was left in flight.

mod actor;
mod engine;
mod model;
mod plan;
mod step;

pub use actor::{
    Execute, GetRecord, MachineActor, MachineSnapshot, PowerObserved, Resume, StepFinished,
};
pub use engine::LifecycleEngine;
pub use model::{
    ActiveTransition, AttemptOutcome, Command, InFlightStep, LifecycleState, MachineRecord,
    MachineRegistration, Plan, PlanStep, ScriptLog, StepAttempt, StepKind, TransitionOutcome,
    TransitionRecord, TransitionTicket,
};
pub use plan::{plan, COMMISSIONING_SCRIPTS, DEPLOY_SCRIPTS, ERASE_SCRIPTS, TESTING_SCRIPTS};
pub use step::{RackRouter, StepError, StepOrder, StepResult, StepRunner};

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use ironfleet_core::error::{Classify, ErrorClass};
use ironfleet_core::ids::{ControllerId, MachineId, StepId, TransitionId};
use ironfleet_core::models::PowerState;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("command '{command}' is not valid in state '{state}'")]
    InvalidTransition {
        state: LifecycleState,
        command: &'static str,
    },

    #[error("machine {machine} is busy with '{command}' (transition {transition})")]
    Busy {
        machine: MachineId,
        transition: TransitionId,
        command: &'static str,
    },

    #[error("no step in flight to abort")]
    NothingToAbort,

    #[error("unknown machine {0}")]
    UnknownMachine(MachineId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lifecycle unavailable: {0}")]
    Unavailable(String),
}

impl Classify for LifecycleError {
    fn class(&self) -> ErrorClass {
        match self {
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::NothingToAbort
            | LifecycleError::UnknownMachine(_) => ErrorClass::CapabilityPermanent,
            LifecycleError::Busy { .. } => ErrorClass::Coordination,
            LifecycleError::Store(e) => e.class(),
            LifecycleError::Unavailable(_) => ErrorClass::TransientTransport,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Dispatch attempts per step before the transition fails.
    pub max_step_attempts: u32,
    pub step_retry_delay: Duration,
    pub power_deadline: Duration,
    pub script_deadline: Duration,
    /// How often a resumed script step polls the rack for its result.
    pub script_poll_interval: Duration,
    /// Buffer of the lifecycle event channel.
    pub event_capacity: usize,
    /// First delay between retried machine record writes.
    pub store_retry_initial: Duration,
    /// Give up on a machine record write after this long.
    pub store_retry_max_elapsed: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            step_retry_delay: Duration::from_secs(2),
            power_deadline: Duration::from_secs(60),
            script_deadline: Duration::from_secs(30 * 60),
            script_poll_interval: Duration::from_secs(5),
            event_capacity: 1024,
            store_retry_initial: Duration::from_millis(100),
            store_retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

/// Published on the engine's broadcast channel and streamed by `/events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    TransitionAccepted {
        machine: MachineId,
        transition: TransitionId,
        command: Command,
        from: LifecycleState,
        pending: LifecycleState,
    },
    StateChanged {
        machine: MachineId,
        transition: Option<TransitionId>,
        from: LifecycleState,
        to: LifecycleState,
    },
    StepStarted {
        machine: MachineId,
        transition: TransitionId,
        step: StepId,
        kind: StepKind,
        attempt: u32,
        rack: ControllerId,
    },
    StepFinished {
        machine: MachineId,
        transition: TransitionId,
        step: StepId,
        kind: StepKind,
        succeeded: bool,
        attempts: usize,
    },
    PowerStateChanged {
        machine: MachineId,
        state: PowerState,
        observed_at: DateTime<Utc>,
    },
    TransitionFinished {
        machine: MachineId,
        transition: TransitionId,
        outcome: TransitionOutcome,
        state: LifecycleState,
        error: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn machine(&self) -> MachineId {
        match self {
            LifecycleEvent::TransitionAccepted { machine, .. }
            | LifecycleEvent::StateChanged { machine, .. }
            | LifecycleEvent::StepStarted { machine, .. }
            | LifecycleEvent::StepFinished { machine, .. }
            | LifecycleEvent::PowerStateChanged { machine, .. }
            | LifecycleEvent::TransitionFinished { machine, .. } => *machine,
        }
    }
}
