//! Lifecycle records
//!
//! A [`MachineRecord`] is the durable unit: current state, last known power
//! state, the transition in progress (with its in-flight step) and the
//! history of finished transitions. Restart reconciliation only needs this
//! record, never the control flow that produced it.

use chrono::{DateTime, Utc};
use ironfleet_core::error::ErrorClass;
use ironfleet_core::ids::{ControllerId, MachineId, SegmentId, StepId, TransitionId};
use ironfleet_core::models::{PowerConfig, PowerState, PowerTarget};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use strum::{Display, EnumIter, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LifecycleState {
    New,
    Commissioning,
    Ready,
    Allocated,
    Deploying,
    Deployed,
    Testing,
    FailedCommissioning,
    FailedTesting,
    FailedDeployment,
    Releasing,
    FailedReleasing,
    /// Administrative quarantine; only `mark-fixed` leaves it.
    Broken,
}

/// Commands accepted by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Commission,
    Test,
    Allocate { owner: String },
    Deploy { image: String },
    Release {
        #[serde(default)]
        erase: bool,
    },
    MarkBroken { reason: String },
    MarkFixed,
    /// Cancel the pending step; counts as a step failure.
    Abort,
    PowerOn,
    PowerOff,
    PowerCycle,
    QueryPower,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Commission => "commission",
            Command::Test => "test",
            Command::Allocate { .. } => "allocate",
            Command::Deploy { .. } => "deploy",
            Command::Release { .. } => "release",
            Command::MarkBroken { .. } => "mark_broken",
            Command::MarkFixed => "mark_fixed",
            Command::Abort => "abort",
            Command::PowerOn => "power_on",
            Command::PowerOff => "power_off",
            Command::PowerCycle => "power_cycle",
            Command::QueryPower => "query_power",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware action performed by one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    PowerQuery,
    PowerOn,
    PowerOff,
    PowerCycle,
    RunScripts { script_set: String },
}

impl StepKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::PowerQuery => "power-query",
            StepKind::PowerOn => "power-on",
            StepKind::PowerOff => "power-off",
            StepKind::PowerCycle => "power-cycle",
            StepKind::RunScripts { .. } => "run-scripts",
        }
    }

    pub fn is_power(&self) -> bool {
        !matches!(self, StepKind::RunScripts { .. })
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::RunScripts { script_set } => write!(f, "run-scripts({script_set})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Entry of a transition plan. `Boot` is resolved when the step starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Query,
    Boot,
    On,
    Off,
    Cycle,
    Scripts { script_set: String },
}

impl PlanStep {
    pub fn scripts(script_set: &str) -> Self {
        PlanStep::Scripts {
            script_set: script_set.to_string(),
        }
    }

    /// Boot power-cycles a machine that is already on.
    pub fn resolve(&self, power: PowerState) -> StepKind {
        match self {
            PlanStep::Query => StepKind::PowerQuery,
            PlanStep::Boot if power == PowerState::On => StepKind::PowerCycle,
            PlanStep::Boot | PlanStep::On => StepKind::PowerOn,
            PlanStep::Off => StepKind::PowerOff,
            PlanStep::Cycle => StepKind::PowerCycle,
            PlanStep::Scripts { script_set } => StepKind::RunScripts {
                script_set: script_set.clone(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

/// One dispatch of a step to a rack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub step: StepId,
    pub kind: StepKind,
    pub attempt: u32,
    pub rack: Option<ControllerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The step currently executing for a machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InFlightStep {
    pub id: StepId,
    pub kind: StepKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionOutcome {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

/// Output captured from one script set run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLog {
    pub step: StepId,
    pub script_set: String,
    pub passed: bool,
    pub logs: String,
}

/// History entry for one accepted command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: TransitionId,
    pub command: Command,
    pub from: LifecycleState,
    pub pending: LifecycleState,
    pub to: Option<LifecycleState>,
    pub outcome: TransitionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: Vec<StepAttempt>,
    #[serde(default)]
    pub logs: Vec<ScriptLog>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// States a transition moves through, fixed when it is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub pending: LifecycleState,
    pub success: LifecycleState,
    pub failure: LifecycleState,
    pub steps: Vec<PlanStep>,
    /// Power the machine off after a failure.
    pub cleanup_on_failure: bool,
}

/// Transition in progress, persisted with the machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveTransition {
    pub record: TransitionRecord,
    pub plan: Plan,
    pub remaining: VecDeque<PlanStep>,
    /// Set once the plan failed and only the power-off cleanup is left.
    #[serde(default)]
    pub cleaning_up: bool,
    #[serde(default)]
    pub in_flight: Option<InFlightStep>,
}

/// Durable machine record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub hostname: String,
    pub segment: SegmentId,
    #[serde(default)]
    pub rack_of_record: Option<ControllerId>,
    pub power: PowerConfig,
    pub state: LifecycleState,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub broken_reason: Option<String>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub active: Option<ActiveTransition>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MachineRecord {
    pub fn new(registration: MachineRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.id,
            hostname: registration.hostname,
            segment: registration.segment,
            rack_of_record: registration.rack_of_record,
            power: registration.power,
            state: LifecycleState::New,
            power_state: PowerState::Unknown,
            owner: None,
            image: None,
            broken_reason: None,
            facts: BTreeMap::new(),
            active: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self) -> PowerTarget {
        PowerTarget {
            machine: self.id,
            power: self.power.clone(),
        }
    }

    pub fn in_flight(&self) -> Option<&InFlightStep> {
        self.active.as_ref().and_then(|a| a.in_flight.as_ref())
    }
}

/// Input to `register_machine`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRegistration {
    #[serde(default)]
    pub id: MachineId,
    pub hostname: String,
    pub segment: SegmentId,
    #[serde(default)]
    pub rack_of_record: Option<ControllerId>,
    pub power: PowerConfig,
}

/// Returned when a command is accepted or coalesced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTicket {
    pub machine: MachineId,
    pub transition: TransitionId,
    /// Step in flight when the ticket was issued, if any.
    pub step: Option<StepId>,
    pub state: LifecycleState,
    /// True when the command matched the transition already in progress.
    pub coalesced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_are_kebab_case() {
        assert_eq!(LifecycleState::FailedCommissioning.to_string(), "failed-commissioning");
        assert_eq!(
            "failed-testing".parse::<LifecycleState>().unwrap(),
            LifecycleState::FailedTesting
        );
        assert_eq!(
            serde_json::to_string(&LifecycleState::FailedReleasing).unwrap(),
            "\"failed-releasing\""
        );
    }

    #[test]
    fn test_boot_resolves_against_power_state() {
        assert_eq!(PlanStep::Boot.resolve(PowerState::On), StepKind::PowerCycle);
        assert_eq!(PlanStep::Boot.resolve(PowerState::Off), StepKind::PowerOn);
        assert_eq!(PlanStep::Boot.resolve(PowerState::Unknown), StepKind::PowerOn);
        assert_eq!(
            PlanStep::scripts("testing").resolve(PowerState::On),
            StepKind::RunScripts {
                script_set: "testing".to_string()
            }
        );
    }

    #[test]
    fn test_command_json() {
        let cmd: Command = serde_json::from_str(r#"{"command":"deploy","image":"jammy"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Deploy {
                image: "jammy".to_string()
            }
        );
        let release: Command = serde_json::from_str(r#"{"command":"release"}"#).unwrap();
        assert_eq!(release, Command::Release { erase: false });
    }

    #[test]
    fn test_step_kind_display() {
        let kind = StepKind::RunScripts {
            script_set: "commissioning".to_string(),
        };
        assert_eq!(kind.to_string(), "run-scripts(commissioning)");
        assert_eq!(kind.label(), "run-scripts");
        assert!(StepKind::PowerOff.is_power());
        assert!(!kind.is_power());
    }
}
