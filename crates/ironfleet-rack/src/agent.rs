//! Region request handler
//!
//! Serves calls arriving from any region connection: power operations and
//! script runs through the wrapped capabilities, service grants through the
//! [`ServiceHost`].

use crate::capability::{PowerControl, ScriptControl};
use crate::observability::{events, metrics};
use crate::services::ServiceHost;
use async_trait::async_trait;
use chrono::Utc;
use ironfleet_core::connection::{CallContext, CallHandler};
use ironfleet_core::error::{ErrorClass, RemoteError};
use ironfleet_core::ids::{MachineId, StepId};
use ironfleet_core::models::{PowerState, PowerTarget};
use ironfleet_core::protocol::{Event, Reply, Request, ScriptStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Recent script runs by step id, so a restarted region can ask how a step
/// ended instead of running it twice. Oldest entries are evicted first.
#[derive(Debug)]
pub struct ScriptJournal {
    capacity: usize,
    order: VecDeque<StepId>,
    entries: HashMap<StepId, (MachineId, ScriptStatus)>,
}

impl ScriptJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, step: StepId, machine: MachineId, status: ScriptStatus) {
        if self.entries.insert(step, (machine, status)).is_none() {
            self.order.push_back(step);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn forget(&mut self, step: StepId) {
        if self.entries.remove(&step).is_some() {
            self.order.retain(|s| *s != step);
        }
    }

    /// Drop the entry only while it still says `Running`.
    pub fn forget_running(&mut self, step: StepId) {
        if matches!(self.entries.get(&step), Some((_, ScriptStatus::Running))) {
            self.forget(step);
        }
    }

    pub fn status(&self, machine: MachineId, step: StepId) -> ScriptStatus {
        match self.entries.get(&step) {
            Some((owner, status)) if *owner == machine => status.clone(),
            _ => ScriptStatus::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Held across a script run. If the run is dropped before it records an
/// outcome (deadline expiry cancels the handler) the `Running` entry is
/// cleared, so a retry of the step starts the scripts again.
struct RunningScript<'a> {
    journal: &'a Mutex<ScriptJournal>,
    step: StepId,
}

impl Drop for RunningScript<'_> {
    fn drop(&mut self) {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .forget_running(self.step);
    }
}

pub struct Agent {
    power: PowerControl,
    scripts: ScriptControl,
    services: Arc<ServiceHost>,
    journal: Mutex<ScriptJournal>,
    last_power: Mutex<HashMap<MachineId, PowerState>>,
    outbox: mpsc::UnboundedSender<Event>,
}

impl Agent {
    pub fn new(
        power: PowerControl,
        scripts: ScriptControl,
        services: Arc<ServiceHost>,
        journal_capacity: usize,
        outbox: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            power,
            scripts,
            services,
            journal: Mutex::new(ScriptJournal::new(journal_capacity)),
            last_power: Mutex::new(HashMap::new()),
            outbox,
        }
    }

    fn journal(&self) -> MutexGuard<'_, ScriptJournal> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember the observed state and push an event when it changed.
    fn observe_power(&self, machine: MachineId, state: PowerState) {
        let previous = {
            let mut last = self
                .last_power
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            last.insert(machine, state).unwrap_or_default()
        };
        if previous != state {
            events::power_state_observed(&machine, previous, state);
            let _ = self.outbox.send(Event::PowerStateChanged {
                machine,
                state,
                observed_at: Utc::now(),
            });
        }
    }

    async fn run_scripts(
        &self,
        target: PowerTarget,
        script_set: String,
        step: StepId,
    ) -> Result<Reply, RemoteError> {
        let machine = target.machine;
        let known = self.journal().status(machine, step);
        match known {
            ScriptStatus::Completed(outcome) => {
                debug!(machine_id = %machine, step_id = %step, "Returning recorded script outcome");
                return Ok(Reply::Scripts { outcome });
            }
            ScriptStatus::Running => {
                return Err(RemoteError::new(
                    ErrorClass::TransientHardware,
                    format!("script run for step {step} is still in progress"),
                ));
            }
            ScriptStatus::Unknown => {}
        }

        self.journal().record(step, machine, ScriptStatus::Running);
        let _running = RunningScript {
            journal: &self.journal,
            step,
        };
        info!(machine_id = %machine, step_id = %step, script_set = %script_set, "Running script set");

        match self.scripts.run_scripts(&target, &script_set).await {
            Ok(outcome) => {
                metrics::record_script_run(if outcome.passed { "passed" } else { "failed" });
                self.journal()
                    .record(step, machine, ScriptStatus::Completed(outcome.clone()));
                Ok(Reply::Scripts { outcome })
            }
            Err(err) => {
                metrics::record_script_run("error");
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl CallHandler for Agent {
    async fn handle(&self, ctx: CallContext, request: Request) -> Result<Reply, RemoteError> {
        match request {
            Request::Ping { sent_at } => Ok(Reply::Pong { sent_at }),

            Request::QueryPower { target } => {
                let state = self.power.query(&target).await?;
                self.observe_power(target.machine, state);
                Ok(Reply::Power { state })
            }

            Request::SetPower { target, action } => {
                let state = self.power.set_power(&target, action).await?;
                self.observe_power(target.machine, state);
                Ok(Reply::Power { state })
            }

            Request::RunScripts {
                target,
                script_set,
                step,
            } => self.run_scripts(target, script_set, step).await,

            Request::ScriptStatus { machine, step } => Ok(Reply::ScriptStatus {
                status: self.journal().status(machine, step),
            }),

            Request::StartServing {
                segment,
                service,
                epoch,
            } => {
                let outcome =
                    self.services
                        .start(segment, service, epoch, ctx.peer.id, ctx.connection)?;
                Ok(Reply::Serving {
                    epoch: outcome.epoch,
                    accepted: outcome.accepted,
                })
            }

            Request::StopServing {
                segment,
                service,
                epoch,
            } => {
                self.services.stop(segment, service, epoch);
                Ok(Reply::Ack)
            }

            other @ Request::ReportServing { .. } => Err(RemoteError::unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        DriverError, DriverErrorKind, PowerDriver, RetryPolicy, ScriptRunner,
    };
    use ironfleet_core::ids::{ConnectionId, ControllerId, SegmentId};
    use ironfleet_core::models::{
        ControllerIdentity, ControllerKind, PowerAction, PowerConfig, ScriptOutcome,
        SegmentCapability, ServiceKind,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct AlwaysOn;

    #[async_trait]
    impl PowerDriver for AlwaysOn {
        async fn query(&self, _target: &PowerTarget) -> Result<PowerState, DriverError> {
            Ok(PowerState::On)
        }

        async fn set_power(
            &self,
            _target: &PowerTarget,
            action: PowerAction,
        ) -> Result<(), DriverError> {
            match action {
                PowerAction::On => Err(DriverError::new(
                    DriverErrorKind::AlreadyInState,
                    "already on",
                )),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl ScriptRunner for CountingRunner {
        async fn run_scripts(
            &self,
            _target: &PowerTarget,
            script_set: &str,
        ) -> Result<ScriptOutcome, DriverError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(script_outcome_passed(script_set))
        }
    }

    fn script_outcome_passed(logs: &str) -> ScriptOutcome {
        ScriptOutcome {
            passed: true,
            logs: logs.to_string(),
            exit_code: Some(0),
            facts: Default::default(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(1),
        }
    }

    fn agent(
        runner: Arc<CountingRunner>,
        segment: SegmentId,
    ) -> (Agent, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let services = Arc::new(ServiceHost::new(&[SegmentCapability::new(
            segment,
            [ServiceKind::Boot],
        )]));
        let agent = Agent::new(
            PowerControl::new(Arc::new(AlwaysOn), fast()),
            ScriptControl::new(runner, fast()),
            services,
            8,
            tx,
        );
        (agent, rx)
    }

    fn ctx() -> CallContext {
        CallContext {
            connection: ConnectionId::new(),
            peer: ControllerIdentity {
                id: ControllerId::new(),
                kind: ControllerKind::Region,
                name: "region-1".into(),
                started_at: Utc::now(),
                version: "test".into(),
                protocol: ironfleet_core::version::PROTOCOL_REVISION,
                segments: Vec::new(),
            },
        }
    }

    fn target(machine: MachineId) -> PowerTarget {
        PowerTarget {
            machine,
            power: PowerConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_power_on_when_already_on_succeeds_and_reports_once() {
        let (agent, mut events) = agent(Arc::default(), SegmentId::new());
        let machine = MachineId::new();

        for _ in 0..2 {
            let reply = agent
                .handle(
                    ctx(),
                    Request::SetPower {
                        target: target(machine),
                        action: PowerAction::On,
                    },
                )
                .await
                .unwrap();
            assert_eq!(reply, Reply::Power { state: PowerState::On });
        }

        // Unknown -> On once; the repeat is not a change.
        assert!(matches!(
            events.try_recv(),
            Ok(Event::PowerStateChanged {
                state: PowerState::On,
                ..
            })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_script_outcome_is_journaled_by_step() {
        let runner = Arc::new(CountingRunner::default());
        let (agent, _events) = agent(runner.clone(), SegmentId::new());
        let machine = MachineId::new();
        let step = StepId::new();
        let run = || Request::RunScripts {
            target: target(machine),
            script_set: "commissioning".into(),
            step,
        };

        agent.handle(ctx(), run()).await.unwrap();
        // Redelivery of the same step does not run the scripts again.
        let reply = agent.handle(ctx(), run()).await.unwrap();
        assert!(matches!(reply, Reply::Scripts { outcome } if outcome.passed));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        let status = agent
            .handle(ctx(), Request::ScriptStatus { machine, step })
            .await
            .unwrap();
        assert!(matches!(
            status,
            Reply::ScriptStatus {
                status: ScriptStatus::Completed(_)
            }
        ));

        let unknown = agent
            .handle(
                ctx(),
                Request::ScriptStatus {
                    machine,
                    step: StepId::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            unknown,
            Reply::ScriptStatus {
                status: ScriptStatus::Unknown
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_script_run_can_be_dispatched_again() {
        let runner = Arc::new(CountingRunner {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (agent, _events) = agent(runner.clone(), SegmentId::new());
        let machine = MachineId::new();
        let step = StepId::new();
        let run = || Request::RunScripts {
            target: target(machine),
            script_set: "commissioning".into(),
            step,
        };

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), agent.handle(ctx(), run())).await;
        assert!(cancelled.is_err());
        assert_eq!(
            agent.journal().status(machine, step),
            ScriptStatus::Unknown
        );

        let reply = agent.handle(ctx(), run()).await.unwrap();
        assert!(matches!(reply, Reply::Scripts { outcome } if outcome.passed));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert!(matches!(
            agent.journal().status(machine, step),
            ScriptStatus::Completed(_)
        ));
    }

    #[test]
    fn test_journal_keeps_completed_entries_on_cleanup() {
        let mut journal = ScriptJournal::new(4);
        let machine = MachineId::new();
        let (running, done) = (StepId::new(), StepId::new());
        journal.record(running, machine, ScriptStatus::Running);
        journal.record(
            done,
            machine,
            ScriptStatus::Completed(script_outcome_passed("ok")),
        );

        journal.forget_running(running);
        journal.forget_running(done);
        assert_eq!(journal.status(machine, running), ScriptStatus::Unknown);
        assert!(matches!(
            journal.status(machine, done),
            ScriptStatus::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_start_serving_uses_calling_region() {
        let segment = SegmentId::new();
        let (agent, _events) = agent(Arc::default(), segment);
        let reply = agent
            .handle(
                ctx(),
                Request::StartServing {
                    segment,
                    service: ServiceKind::Boot,
                    epoch: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Serving {
                epoch: 1,
                accepted: true
            }
        );
        assert!(agent.services.is_serving(segment, ServiceKind::Boot));
    }

    #[test]
    fn test_journal_evicts_oldest() {
        let mut journal = ScriptJournal::new(2);
        let machine = MachineId::new();
        let steps: Vec<_> = (0..3).map(|_| StepId::new()).collect();
        for step in &steps {
            journal.record(*step, machine, ScriptStatus::Running);
        }
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.status(machine, steps[0]), ScriptStatus::Unknown);
        assert_eq!(journal.status(machine, steps[2]), ScriptStatus::Running);
        // Another machine cannot read this machine's step.
        assert_eq!(
            journal.status(MachineId::new(), steps[2]),
            ScriptStatus::Unknown
        );
    }
}
