//! MachineActor Implementation
//!
//! One actor per machine. The mailbox serializes every command, step result
//! and power observation for the machine, which is what keeps at most one
//! step in flight. Steps themselves run on a spawned task and report back
//! with `StepFinished`; a result whose step id is no longer in flight is
//! dropped.
//!
//! Lifecycle events and step dispatches are held back until the record that
//! produced them is written. A command whose write fails is rolled back and
//! returned as an error.

use super::model::{
    ActiveTransition, AttemptOutcome, Command, InFlightStep, LifecycleState, MachineRecord, Plan,
    PlanStep, ScriptLog, StepAttempt, StepKind, TransitionOutcome, TransitionRecord,
    TransitionTicket,
};
use super::plan;
use super::step::{StepOrder, StepResult, StepRunner};
use super::{LifecycleError, LifecycleEvent};
use crate::observability::{events, metrics};
use crate::store::{Store, StoreError};
use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use ironfleet_core::error::{Classify, ErrorClass};
use ironfleet_core::ids::{StepId, TransitionId};
use ironfleet_core::models::PowerState;
use kameo::prelude::*;
use kameo::Reply;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request a lifecycle command.
#[derive(Debug, Clone)]
pub struct Execute {
    pub command: Command,
}

/// Current machine record.
#[derive(Debug, Clone)]
pub struct GetRecord;

#[derive(Debug, Clone, Reply)]
pub struct MachineSnapshot {
    pub record: MachineRecord,
}

/// Sent by the step task once every attempt is done.
#[derive(Debug, Clone)]
pub struct StepFinished {
    pub step: StepId,
    pub attempts: Vec<StepAttempt>,
    pub result: StepResult,
}

/// Power state pushed by a rack.
#[derive(Debug, Clone)]
pub struct PowerObserved {
    pub state: PowerState,
    pub observed_at: DateTime<Utc>,
}

/// Pick up a transition loaded from the store.
#[derive(Debug, Clone)]
pub struct Resume;

#[derive(Actor)]
pub struct MachineActor {
    record: MachineRecord,
    store: Store,
    runner: Arc<StepRunner>,
    events: broadcast::Sender<LifecycleEvent>,
    step_task: Option<JoinHandle<()>>,
    /// Published once the record is written.
    pending_events: Vec<LifecycleEvent>,
    /// Spawned once the record is written.
    pending_step: Option<StepOrder>,
}

impl MachineActor {
    pub fn new(
        record: MachineRecord,
        store: Store,
        runner: Arc<StepRunner>,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            record,
            store,
            runner,
            events,
            step_task: None,
            pending_events: Vec::new(),
            pending_step: None,
        }
    }

    fn ticket(&self, transition: TransitionId, coalesced: bool) -> TransitionTicket {
        let step = self
            .record
            .active
            .as_ref()
            .filter(|a| a.record.id == transition)
            .and_then(|a| a.in_flight.as_ref())
            .map(|s| s.id);
        TransitionTicket {
            machine: self.record.id,
            transition,
            step,
            state: self.record.state,
            coalesced,
        }
    }

    fn emit(&mut self, event: LifecycleEvent) {
        self.pending_events.push(event);
    }

    /// Publish held events and spawn the dispatched step.
    fn flush(&mut self, me: &ActorRef<Self>) {
        for event in self.pending_events.drain(..) {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        let Some(order) = self.pending_step.take() else {
            return;
        };
        let runner = self.runner.clone();
        let me = me.clone();
        self.step_task = Some(tokio::spawn(async move {
            let (attempts, result) = runner.run(&order).await;
            let finished = StepFinished {
                step: order.step,
                attempts,
                result,
            };
            if let Err(e) = me.tell(finished).send().await {
                debug!(machine_id = %order.machine, error = %e, "Machine actor gone before step result");
            }
        }));
    }

    fn set_state(&mut self, to: LifecycleState, transition: Option<TransitionId>) {
        let from = self.record.state;
        if from == to {
            return;
        }
        self.record.state = to;
        events::machine_state_changed(
            &self.record.id.to_string(),
            &from.to_string(),
            &to.to_string(),
            &transition.map(|t| t.to_string()).unwrap_or_default(),
        );
        metrics::machine_state_moved(Some(&from.to_string()), &to.to_string());
        self.emit(LifecycleEvent::StateChanged {
            machine: self.record.id,
            transition,
            from,
            to,
        });
    }

    fn observe_power(&mut self, state: PowerState, observed_at: DateTime<Utc>) -> bool {
        if self.record.power_state == state {
            return false;
        }
        self.record.power_state = state;
        self.emit(LifecycleEvent::PowerStateChanged {
            machine: self.record.id,
            state,
            observed_at,
        });
        true
    }

    /// Write the record, retrying transient store errors.
    async fn persist(&mut self) -> Result<(), StoreError> {
        self.record.updated_at = Utc::now();
        let config = self.runner.config();
        let policy = ExponentialBackoff {
            current_interval: config.store_retry_initial,
            initial_interval: config.store_retry_initial,
            max_interval: config.store_retry_initial * 16,
            max_elapsed_time: Some(config.store_retry_max_elapsed),
            ..Default::default()
        };
        let store = &self.store;
        let record = &self.record;

        let result = retry(policy, || async move {
            store.put_machine(record).await.map_err(|e| {
                if e.class().is_retryable() {
                    debug!(machine_id = %record.id, error = %e, "Machine write failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        if let Err(e) = &result {
            events::store_write_failed(
                "machine",
                &Store::machine_key(&self.record.id),
                &e.to_string(),
            );
        }
        result
    }

    /// Write the record and release what it gates. On failure the state stays
    /// in memory and goes out with the next write.
    async fn commit(&mut self, me: &ActorRef<Self>) {
        if self.persist().await.is_err() {
            warn!(machine_id = %self.record.id, "Continuing with unsaved machine state");
        }
        self.flush(me);
    }

    /// Restore the record a command started from after its write failed.
    fn roll_back(&mut self, previous: MachineRecord, me: &ActorRef<Self>) {
        warn!(machine_id = %self.record.id, "Command not applied, machine record could not be written");
        self.pending_events.clear();
        self.pending_step = None;
        if previous.state != self.record.state {
            metrics::machine_state_moved(
                Some(&self.record.state.to_string()),
                &previous.state.to_string(),
            );
        }
        self.record = previous;

        // Abort and supersede cancel the running step; start it again.
        if self.step_task.is_none() {
            let in_flight = self.record.active.as_ref().and_then(|a| a.in_flight.clone());
            if let Some(step) = in_flight {
                self.dispatch(step.kind, Some(step.id));
                self.flush(me);
            }
        }
    }

    fn begin(&mut self, command: Command, plan: Plan) -> TransitionId {
        let from = self.record.state;
        let record = TransitionRecord {
            id: TransitionId::new(),
            command: command.clone(),
            from,
            pending: plan.pending,
            to: None,
            outcome: TransitionOutcome::Pending,
            started_at: Utc::now(),
            finished_at: None,
            attempts: Vec::new(),
            logs: Vec::new(),
            facts: BTreeMap::new(),
            error: None,
        };
        let id = record.id;

        match &command {
            Command::Deploy { image } => self.record.image = Some(image.clone()),
            Command::MarkBroken { reason } => self.record.broken_reason = Some(reason.clone()),
            _ => {}
        }

        events::transition_accepted(
            &self.record.id.to_string(),
            &id.to_string(),
            command.name(),
            &from.to_string(),
        );
        self.emit(LifecycleEvent::TransitionAccepted {
            machine: self.record.id,
            transition: id,
            command: command.clone(),
            from,
            pending: plan.pending,
        });

        let pending = plan.pending;
        self.record.active = Some(ActiveTransition {
            record,
            remaining: plan.steps.iter().cloned().collect(),
            plan,
            cleaning_up: false,
            in_flight: None,
        });
        self.set_state(pending, Some(id));
        self.advance();
        id
    }

    /// Start the next step, or finish when none is left.
    fn advance(&mut self) {
        let Some(active) = self.record.active.as_mut() else {
            return;
        };
        if active.in_flight.is_some() {
            return;
        }
        let next = active.remaining.pop_front();
        let cleaning_up = active.cleaning_up;

        match next {
            Some(step) => {
                let kind = step.resolve(self.record.power_state);
                self.dispatch(kind, None);
            }
            None if cleaning_up => self.finish(TransitionOutcome::Failed),
            None => self.finish(TransitionOutcome::Succeeded),
        }
    }

    /// Mark a step in flight; its runner is spawned on the next flush.
    /// `resume` keeps the id of a step that may already have run.
    fn dispatch(&mut self, kind: StepKind, resume: Option<StepId>) {
        let target = self.record.target();
        let segment = self.record.segment;
        let rack_of_record = self.record.rack_of_record;
        let machine = self.record.id;
        let Some(active) = self.record.active.as_mut() else {
            return;
        };

        let step = InFlightStep {
            id: resume.unwrap_or_default(),
            kind: kind.clone(),
            started_at: Utc::now(),
        };
        let order = StepOrder {
            machine,
            transition: active.record.id,
            step: step.id,
            kind,
            target,
            segment,
            rack_of_record,
            resumed: resume.is_some(),
        };
        active.in_flight = Some(step);
        self.pending_step = Some(order);
    }

    /// Enter the failure state and queue the cleanup power-off. A failure
    /// during cleanup ends the transition.
    fn fail(&mut self, message: String) {
        let Some(active) = self.record.active.as_mut() else {
            return;
        };
        if active.record.error.is_none() {
            active.record.error = Some(message);
        }
        if active.cleaning_up {
            self.finish(TransitionOutcome::Failed);
            return;
        }

        active.cleaning_up = true;
        active.remaining.clear();
        if active.plan.cleanup_on_failure {
            active.remaining.push_back(PlanStep::Off);
        }
        let failure = active.plan.failure;
        let id = active.record.id;

        self.set_state(failure, Some(id));
        self.advance();
    }

    fn finish(&mut self, outcome: TransitionOutcome) {
        let Some(mut active) = self.record.active.take() else {
            return;
        };
        self.step_task = None;

        if outcome == TransitionOutcome::Succeeded {
            match &active.record.command {
                Command::Allocate { owner } => self.record.owner = Some(owner.clone()),
                Command::Release { .. } => {
                    self.record.owner = None;
                    self.record.image = None;
                }
                Command::MarkFixed => self.record.broken_reason = None,
                _ => {}
            }
            self.set_state(active.plan.success, Some(active.record.id));
        }

        let state = self.record.state;
        active.record.to = Some(state);
        active.record.outcome = outcome;
        active.record.finished_at = Some(Utc::now());

        events::transition_finished(
            &self.record.id.to_string(),
            &active.record.id.to_string(),
            &outcome.to_string(),
            &state.to_string(),
        );
        self.emit(LifecycleEvent::TransitionFinished {
            machine: self.record.id,
            transition: active.record.id,
            outcome,
            state,
            error: active.record.error.clone(),
        });
        self.record.history.push(active.record);
    }

    /// Close the active transition as aborted without running cleanup.
    fn supersede(&mut self, reason: &str) {
        if let Some(task) = self.step_task.take() {
            task.abort();
        }
        if let Some(active) = self.record.active.as_mut() {
            if let Some(step) = active.in_flight.take() {
                active.record.attempts.push(aborted_attempt(&step, reason));
            }
            active.record.error = Some(reason.to_string());
        }
        self.finish(TransitionOutcome::Aborted);
    }

    fn abort(&mut self) -> Result<TransitionTicket, LifecycleError> {
        let machine = self.record.id;
        let Some(active) = self.record.active.as_mut() else {
            return Err(LifecycleError::NothingToAbort);
        };
        let Some(step) = active.in_flight.take() else {
            return Err(LifecycleError::NothingToAbort);
        };
        let transition = active.record.id;
        if let Some(task) = self.step_task.take() {
            task.abort();
        }

        active
            .record
            .attempts
            .push(aborted_attempt(&step, "aborted by operator"));
        let attempts = active
            .record
            .attempts
            .iter()
            .filter(|a| a.step == step.id)
            .count();

        info!(machine_id = %machine, step_id = %step.id, "Aborting in-flight step");
        events::step_finished(
            &machine.to_string(),
            &step.id.to_string(),
            step.kind.label(),
            "aborted",
            attempts,
        );
        metrics::record_step(step.kind.label(), "aborted");
        self.emit(LifecycleEvent::StepFinished {
            machine,
            transition,
            step: step.id,
            kind: step.kind.clone(),
            succeeded: false,
            attempts,
        });

        self.fail("step aborted by operator".to_string());
        Ok(self.ticket(transition, false))
    }

    fn on_step_finished(&mut self, msg: StepFinished) {
        let machine = self.record.id;
        let Some(active) = self.record.active.as_mut() else {
            debug!(machine_id = %machine, step_id = %msg.step, "Step result without active transition");
            return;
        };
        let Some(step) = active.in_flight.take_if(|s| s.id == msg.step) else {
            debug!(machine_id = %machine, step_id = %msg.step, "Dropping result of a step no longer in flight");
            return;
        };
        let transition = active.record.id;
        let attempts = msg.attempts.len();
        active.record.attempts.extend(msg.attempts);

        let failure = match msg.result {
            StepResult::Power(_) => None,
            StepResult::Scripts(ref outcome) => {
                let script_set = match &step.kind {
                    StepKind::RunScripts { script_set } => script_set.clone(),
                    _ => String::new(),
                };
                active.record.logs.push(ScriptLog {
                    step: step.id,
                    script_set: script_set.clone(),
                    passed: outcome.passed,
                    logs: outcome.logs.clone(),
                });
                if outcome.passed {
                    active.record.facts.extend(outcome.facts.clone());
                    None
                } else {
                    Some(format!(
                        "script set '{script_set}' failed (exit code {})",
                        outcome
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    ))
                }
            }
            StepResult::Failed {
                class,
                ref message,
            } => Some(format!("{class}: {message}")),
        };
        self.step_task = None;

        match msg.result {
            StepResult::Power(state) => {
                self.observe_power(state, Utc::now());
            }
            StepResult::Scripts(outcome) if outcome.passed => {
                self.record.facts.extend(outcome.facts);
            }
            _ => {}
        }

        let label = if failure.is_none() { "succeeded" } else { "failed" };
        events::step_finished(
            &machine.to_string(),
            &step.id.to_string(),
            step.kind.label(),
            label,
            attempts,
        );
        metrics::record_step(step.kind.label(), label);
        self.emit(LifecycleEvent::StepFinished {
            machine,
            transition,
            step: step.id,
            kind: step.kind,
            succeeded: failure.is_none(),
            attempts,
        });

        match failure {
            None => self.advance(),
            Some(message) => {
                warn!(machine_id = %machine, transition_id = %transition, error = %message, "Step failed");
                self.fail(message);
            }
        }
    }
}

fn aborted_attempt(step: &InFlightStep, reason: &str) -> StepAttempt {
    StepAttempt {
        step: step.id,
        kind: step.kind.clone(),
        attempt: 0,
        rack: None,
        started_at: step.started_at,
        finished_at: Utc::now(),
        outcome: AttemptOutcome::Aborted,
        error_class: Some(ErrorClass::CapabilityPermanent),
        message: Some(reason.to_string()),
    }
}

impl Message<Execute> for MachineActor {
    type Reply = Result<TransitionTicket, LifecycleError>;

    async fn handle(&mut self, msg: Execute, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let me = ctx.actor_ref().clone();
        let previous = self.record.clone();

        let ticket = if msg.command == Command::Abort {
            self.abort()?
        } else {
            let superseding = match &self.record.active {
                Some(active) if active.record.command == msg.command => {
                    debug!(
                        machine_id = %self.record.id,
                        transition_id = %active.record.id,
                        command = %msg.command,
                        "Coalescing duplicate command"
                    );
                    return Ok(self.ticket(active.record.id, true));
                }
                Some(active) if !matches!(msg.command, Command::MarkBroken { .. }) => {
                    return Err(LifecycleError::Busy {
                        machine: self.record.id,
                        transition: active.record.id,
                        command: active.record.command.name(),
                    });
                }
                Some(_) => true,
                None => false,
            };

            let plan = plan::plan(self.record.state, &msg.command)?;
            if superseding {
                self.supersede("superseded by mark_broken");
            }
            let transition = self.begin(msg.command, plan);
            self.ticket(transition, false)
        };

        if let Err(e) = self.persist().await {
            self.roll_back(previous, &me);
            return Err(e.into());
        }
        self.flush(&me);
        Ok(ticket)
    }
}

impl Message<GetRecord> for MachineActor {
    type Reply = MachineSnapshot;

    async fn handle(&mut self, _msg: GetRecord, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        MachineSnapshot {
            record: self.record.clone(),
        }
    }
}

impl Message<StepFinished> for MachineActor {
    type Reply = ();

    async fn handle(&mut self, msg: StepFinished, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let me = ctx.actor_ref().clone();
        self.on_step_finished(msg);
        self.commit(&me).await;
    }
}

impl Message<PowerObserved> for MachineActor {
    type Reply = ();

    async fn handle(&mut self, msg: PowerObserved, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.observe_power(msg.state, msg.observed_at) {
            let me = ctx.actor_ref().clone();
            self.commit(&me).await;
        }
    }
}

impl Message<Resume> for MachineActor {
    type Reply = ();

    async fn handle(&mut self, _msg: Resume, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let me = ctx.actor_ref().clone();
        let Some(active) = &self.record.active else {
            return;
        };
        match active.in_flight.clone() {
            Some(step) => {
                info!(
                    machine_id = %self.record.id,
                    step_id = %step.id,
                    kind = %step.kind,
                    "Reconciling step left in flight"
                );
                self.dispatch(step.kind, Some(step.id));
            }
            None => self.advance(),
        }
        self.commit(&me).await;
    }
}
