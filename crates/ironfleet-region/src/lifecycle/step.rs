//! Step execution
//!
//! A step is dispatched to a rack and retried up to `max_step_attempts`
//! times. Each attempt resolves the rack again, so a retry after a
//! re-election lands on the new owner. Driver-level retries happen on the
//! rack underneath every attempt.
//!
//! Script steps that may already have run (a retry, or a step found
//! in flight after a restart) first ask the rack for the result recorded
//! under the step id and only re-dispatch when the rack knows nothing.

use super::model::{AttemptOutcome, StepAttempt, StepKind};
use super::{LifecycleConfig, LifecycleEvent};
use crate::observability::{events, metrics};
use crate::session::{route, RegionSession};
use crate::store::{Store, StoreError};
use chrono::Utc;
use ironfleet_core::connection::Connection;
use ironfleet_core::error::{CallError, Classify, ErrorClass};
use ironfleet_core::ids::{ControllerId, MachineId, SegmentId, StepId, TransitionId};
use ironfleet_core::models::{PowerAction, PowerState, PowerTarget, ScriptOutcome, ServiceKind};
use ironfleet_core::protocol::{Reply, Request, ScriptStatus};
use kameo::prelude::*;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("no connected rack serves segment {0}")]
    NoRack(SegmentId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for StepError {
    fn class(&self) -> ErrorClass {
        match self {
            StepError::Call(e) => e.class(),
            StepError::NoRack(_) => ErrorClass::TransientTransport,
            StepError::Store(e) => e.class(),
        }
    }
}

/// Terminal result of a step after all attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Power(PowerState),
    Scripts(ScriptOutcome),
    Failed { class: ErrorClass, message: String },
}

/// Finds the rack that acts for a machine.
#[derive(Clone)]
pub struct RackRouter {
    store: Store,
    session: ActorRef<RegionSession>,
}

impl RackRouter {
    pub fn new(store: Store, session: ActorRef<RegionSession>) -> Self {
        Self { store, session }
    }

    /// The rack of record when connected, else the owner of the segment's
    /// boot service.
    pub async fn resolve(
        &self,
        segment: SegmentId,
        rack_of_record: Option<ControllerId>,
    ) -> Result<Connection, StepError> {
        if let Some(rack) = rack_of_record {
            if let Some(connection) = route(&self.session, rack).await {
                return Ok(connection);
            }
            debug!(rack_id = %rack, segment_id = %segment, "Rack of record not connected, using boot owner");
        }

        let assignment = self
            .store
            .load_assignment(segment, ServiceKind::Boot)
            .await?
            .value;
        match assignment.owner {
            Some(owner) => route(&self.session, owner)
                .await
                .ok_or(StepError::NoRack(segment)),
            None => Err(StepError::NoRack(segment)),
        }
    }
}

/// One step to run for one machine.
#[derive(Debug, Clone)]
pub struct StepOrder {
    pub machine: MachineId,
    pub transition: TransitionId,
    pub step: StepId,
    pub kind: StepKind,
    pub target: PowerTarget,
    pub segment: SegmentId,
    pub rack_of_record: Option<ControllerId>,
    /// The step may already have run on a rack.
    pub resumed: bool,
}

pub struct StepRunner {
    router: RackRouter,
    config: LifecycleConfig,
    events: broadcast::Sender<LifecycleEvent>,
}

impl StepRunner {
    pub fn new(
        router: RackRouter,
        config: LifecycleConfig,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            router,
            config,
            events,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run every attempt of `order`. Returns the attempt history and the
    /// final result.
    pub async fn run(&self, order: &StepOrder) -> (Vec<StepAttempt>, StepResult) {
        let max_attempts = self.config.max_step_attempts.max(1);
        let mut attempts = Vec::new();
        let mut last_error: Option<StepError> = None;

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let timer = Instant::now();

            let outcome = match self
                .router
                .resolve(order.segment, order.rack_of_record)
                .await
            {
                Ok(connection) => {
                    let rack = connection.peer().id;
                    events::step_started(
                        &order.machine.to_string(),
                        &order.step.to_string(),
                        order.kind.label(),
                        attempt,
                        &rack.to_string(),
                    );
                    let _ = self.events.send(LifecycleEvent::StepStarted {
                        machine: order.machine,
                        transition: order.transition,
                        step: order.step,
                        kind: order.kind.clone(),
                        attempt,
                        rack,
                    });
                    let check_first = order.resumed || attempt > 1;
                    (Some(rack), self.execute(&connection, order, check_first).await)
                }
                Err(e) => (None, Err(e)),
            };
            metrics::record_step_attempt(order.kind.label(), timer.elapsed());

            let (rack, result) = outcome;
            match result {
                Ok(result) => {
                    attempts.push(StepAttempt {
                        step: order.step,
                        kind: order.kind.clone(),
                        attempt,
                        rack,
                        started_at,
                        finished_at: Utc::now(),
                        outcome: AttemptOutcome::Succeeded,
                        error_class: None,
                        message: None,
                    });
                    return (attempts, result);
                }
                Err(e) => {
                    let class = e.class();
                    let timed_out = matches!(e, StepError::Call(CallError::Timeout { .. }));
                    attempts.push(StepAttempt {
                        step: order.step,
                        kind: order.kind.clone(),
                        attempt,
                        rack,
                        started_at,
                        finished_at: Utc::now(),
                        outcome: if timed_out {
                            AttemptOutcome::TimedOut
                        } else {
                            AttemptOutcome::Failed
                        },
                        error_class: Some(class),
                        message: Some(e.to_string()),
                    });
                    debug!(
                        machine_id = %order.machine,
                        step_id = %order.step,
                        attempt = attempt,
                        error_class = %class,
                        error = %e,
                        "Step attempt failed"
                    );

                    if !class.is_retryable() {
                        return (
                            attempts,
                            StepResult::Failed {
                                class,
                                message: e.to_string(),
                            },
                        );
                    }
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.step_retry_delay).await;
                    }
                }
            }
        }

        let (class, message) = match last_error {
            Some(e) => (e.class(), e.to_string()),
            None => (ErrorClass::TransientTransport, "no attempt was made".to_string()),
        };
        (
            attempts,
            StepResult::Failed {
                class,
                message: format!("gave up after {max_attempts} attempts: {message}"),
            },
        )
    }

    async fn execute(
        &self,
        connection: &Connection,
        order: &StepOrder,
        check_first: bool,
    ) -> Result<StepResult, StepError> {
        let target = order.target.clone();
        match &order.kind {
            StepKind::PowerQuery => {
                let reply = connection
                    .call(Request::QueryPower { target }, self.config.power_deadline)
                    .await?;
                power_reply(reply)
            }
            StepKind::PowerOn | StepKind::PowerOff | StepKind::PowerCycle => {
                let action = match order.kind {
                    StepKind::PowerOn => PowerAction::On,
                    StepKind::PowerOff => PowerAction::Off,
                    _ => PowerAction::Cycle,
                };
                let reply = connection
                    .call(Request::SetPower { target, action }, self.config.power_deadline)
                    .await?;
                power_reply(reply)
            }
            StepKind::RunScripts { script_set } => {
                if check_first {
                    if let Some(outcome) = self.recorded_outcome(connection, order).await? {
                        return Ok(StepResult::Scripts(outcome));
                    }
                }
                let request = Request::RunScripts {
                    target,
                    script_set: script_set.clone(),
                    step: order.step,
                };
                match connection.call(request, self.config.script_deadline).await? {
                    Reply::Scripts { outcome } => Ok(StepResult::Scripts(outcome)),
                    other => Err(CallError::UnexpectedReply(format!("{other:?}")).into()),
                }
            }
        }
    }

    /// Result the rack kept for this step id, waiting while it still runs.
    async fn recorded_outcome(
        &self,
        connection: &Connection,
        order: &StepOrder,
    ) -> Result<Option<ScriptOutcome>, StepError> {
        let deadline = Instant::now() + self.config.script_deadline;
        loop {
            let request = Request::ScriptStatus {
                machine: order.machine,
                step: order.step,
            };
            match connection.call(request, self.config.power_deadline).await? {
                Reply::ScriptStatus {
                    status: ScriptStatus::Completed(outcome),
                } => return Ok(Some(outcome)),
                Reply::ScriptStatus {
                    status: ScriptStatus::Unknown,
                } => return Ok(None),
                Reply::ScriptStatus {
                    status: ScriptStatus::Running,
                } => {
                    if Instant::now() >= deadline {
                        return Err(CallError::Timeout {
                            seq: 0,
                            after: self.config.script_deadline,
                        }
                        .into());
                    }
                    tokio::time::sleep(self.config.script_poll_interval).await;
                }
                other => {
                    return Err(CallError::UnexpectedReply(format!("{other:?}")).into());
                }
            }
        }
    }
}

fn power_reply(reply: Reply) -> Result<StepResult, StepError> {
    match reply {
        Reply::Power { state } => Ok(StepResult::Power(state)),
        other => Err(CallError::UnexpectedReply(format!("{other:?}")).into()),
    }
}
