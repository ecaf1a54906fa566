//! Transition table
//!
//! Maps (current state, command) to the plan the engine executes. Commands
//! that are not valid from the current state are refused here, before any
//! step exists.

use super::model::{Command, LifecycleState, Plan, PlanStep};
use super::LifecycleError;
use LifecycleState::*;

pub const COMMISSIONING_SCRIPTS: &str = "commissioning";
pub const TESTING_SCRIPTS: &str = "testing";
pub const DEPLOY_SCRIPTS: &str = "deploy";
pub const ERASE_SCRIPTS: &str = "erase";

pub fn plan(state: LifecycleState, command: &Command) -> Result<Plan, LifecycleError> {
    let invalid = || LifecycleError::InvalidTransition {
        state,
        command: command.name(),
    };

    let plan = match command {
        Command::Commission => match state {
            New | Ready | FailedCommissioning | FailedTesting | FailedDeployment => Plan {
                pending: Commissioning,
                success: Ready,
                failure: FailedCommissioning,
                steps: vec![
                    PlanStep::Query,
                    PlanStep::Boot,
                    PlanStep::scripts(COMMISSIONING_SCRIPTS),
                ],
                cleanup_on_failure: true,
            },
            _ => return Err(invalid()),
        },
        Command::Test => match state {
            Ready | FailedTesting => Plan {
                pending: Testing,
                success: Ready,
                failure: FailedTesting,
                steps: vec![
                    PlanStep::Query,
                    PlanStep::Boot,
                    PlanStep::scripts(TESTING_SCRIPTS),
                    PlanStep::Off,
                ],
                cleanup_on_failure: true,
            },
            _ => return Err(invalid()),
        },
        Command::Allocate { .. } => match state {
            Ready => Plan {
                pending: Allocated,
                success: Allocated,
                failure: Ready,
                steps: Vec::new(),
                cleanup_on_failure: false,
            },
            _ => return Err(invalid()),
        },
        Command::Deploy { .. } => match state {
            Allocated => Plan {
                pending: Deploying,
                success: Deployed,
                failure: FailedDeployment,
                steps: vec![
                    PlanStep::Query,
                    PlanStep::Boot,
                    PlanStep::scripts(DEPLOY_SCRIPTS),
                ],
                cleanup_on_failure: true,
            },
            _ => return Err(invalid()),
        },
        Command::Release { erase } => match state {
            Deployed | Allocated | FailedCommissioning | FailedTesting | FailedDeployment
            | FailedReleasing => Plan {
                pending: Releasing,
                success: Ready,
                failure: FailedReleasing,
                steps: if *erase {
                    vec![
                        PlanStep::Query,
                        PlanStep::Boot,
                        PlanStep::scripts(ERASE_SCRIPTS),
                        PlanStep::Off,
                    ]
                } else {
                    vec![PlanStep::Off]
                },
                cleanup_on_failure: *erase,
            },
            _ => return Err(invalid()),
        },
        // Always accepted; a failed power-off is recorded but the machine stays broken.
        Command::MarkBroken { .. } => Plan {
            pending: Broken,
            success: Broken,
            failure: Broken,
            steps: vec![PlanStep::Off],
            cleanup_on_failure: false,
        },
        Command::MarkFixed => match state {
            Broken => Plan {
                pending: Broken,
                success: Ready,
                failure: Broken,
                steps: vec![PlanStep::Off],
                cleanup_on_failure: false,
            },
            _ => return Err(invalid()),
        },
        Command::PowerOn | Command::PowerOff | Command::PowerCycle | Command::QueryPower => {
            let step = match command {
                Command::PowerOn => PlanStep::On,
                Command::PowerOff => PlanStep::Off,
                Command::PowerCycle => PlanStep::Cycle,
                _ => PlanStep::Query,
            };
            Plan {
                pending: state,
                success: state,
                failure: state,
                steps: vec![step],
                cleanup_on_failure: false,
            }
        }
        Command::Abort => return Err(LifecycleError::NothingToAbort),
    };

    Ok(plan)
}
