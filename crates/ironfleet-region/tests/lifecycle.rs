//! Machine lifecycle driven end to end through a real rack session.

mod common;

use common::*;
use ironfleet_core::ids::{MachineId, SegmentId};
use ironfleet_core::models::{PowerAction, PowerState};
use ironfleet_region::lifecycle::{
    AttemptOutcome, Command, LifecycleError, LifecycleState, StepKind, TransitionOutcome,
};
use ironfleet_region::store::Store;
use ironfleet_region::{Region, RegionConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    region: Region,
    rack: FakeRack,
    power: Arc<FakePower>,
    scripts: Arc<FakeScripts>,
    segment: SegmentId,
}

async fn setup(power: PowerState, scripts: Arc<FakeScripts>) -> Setup {
    setup_with(region_config(), Store::in_memory(), power, scripts).await
}

async fn setup_with(
    config: RegionConfig,
    store: Store,
    power: PowerState,
    scripts: Arc<FakeScripts>,
) -> Setup {
    let region = start_region_with(config, store).await;
    let segment = SegmentId::new();
    let power = FakePower::new(power);
    let rack = connect_rack(
        &region,
        rack_identity("rack-a", segment),
        power.clone(),
        scripts.clone(),
    );
    wait_for_owner(&region, segment, rack.id()).await;
    Setup {
        region,
        rack,
        power,
        scripts,
        segment,
    }
}

impl Setup {
    async fn teardown(self) {
        self.rack.session.shutdown().await;
        self.region.shutdown().await;
    }
}

/// Scripts get `script_deadline` per attempt and two attempts per step.
fn short_script_deadline() -> RegionConfig {
    let mut config = region_config();
    config.lifecycle.script_deadline = Duration::from_millis(300);
    config.lifecycle.max_step_attempts = 2;
    config
}

async fn register(s: &Setup, hostname: &str) -> MachineId {
    s.region
        .engine
        .register_machine(registration(s.segment, hostname))
        .await
        .unwrap()
        .id
}

/// Wait until a script step is in flight.
async fn wait_for_scripts(region: &Region, id: MachineId) {
    eventually("script step in flight", || async {
        machine(region, id)
            .await
            .in_flight()
            .is_some_and(|s| matches!(s.kind, StepKind::RunScripts { .. }))
    })
    .await;
}

#[tokio::test]
async fn test_commission_new_machine_reaches_ready() {
    let s = setup(PowerState::Off, FakeScripts::passing()).await;
    let registered = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-01"))
        .await
        .unwrap();
    assert_eq!(registered.state, LifecycleState::New);

    let ticket = s
        .region
        .engine
        .request(registered.id, Command::Commission)
        .await
        .unwrap();
    assert!(!ticket.coalesced);
    assert_eq!(ticket.state, LifecycleState::Commissioning);

    let record = wait_idle(&s.region, registered.id).await;
    assert_eq!(record.state, LifecycleState::Ready);
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.power_state, PowerState::On);
    assert_eq!(record.facts.get("cpu_count").map(String::as_str), Some("16"));

    let transition = &record.history[0];
    assert_eq!(transition.id, ticket.transition);
    assert_eq!(transition.outcome, TransitionOutcome::Succeeded);
    assert_eq!(transition.to, Some(LifecycleState::Ready));
    let kinds: Vec<_> = transition.attempts.iter().map(|a| a.kind.label()).collect();
    assert_eq!(kinds, vec!["power-query", "power-on", "run-scripts"]);
    assert!(transition
        .attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::Succeeded && a.rack == Some(s.rack.id())));

    // Steps never overlap.
    for pair in transition.attempts.windows(2) {
        assert!(pair[0].finished_at <= pair[1].started_at);
    }
    assert_eq!(*s.power.actions.lock().unwrap(), vec![PowerAction::On]);
    s.teardown().await;
}

#[tokio::test]
async fn test_failed_testing_powers_off_and_keeps_logs() {
    let s = setup(PowerState::Off, FakeScripts::new(&["testing"], Duration::ZERO)).await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-02"))
        .await
        .unwrap()
        .id;
    s.region.engine.request(id, Command::Commission).await.unwrap();
    assert_eq!(wait_idle(&s.region, id).await.state, LifecycleState::Ready);

    s.region.engine.request(id, Command::Test).await.unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::FailedTesting);
    assert_eq!(record.power_state, PowerState::Off);
    assert_eq!(s.power.state(), PowerState::Off);

    let transition = record.history.last().unwrap();
    assert_eq!(transition.outcome, TransitionOutcome::Failed);
    assert_eq!(transition.logs.len(), 1);
    assert!(!transition.logs[0].passed);
    assert!(transition.logs[0].logs.contains("FAILED"));
    assert!(transition.error.is_some());
    assert_eq!(
        transition.attempts.last().map(|a| a.kind.clone()),
        Some(StepKind::PowerOff)
    );
    s.teardown().await;
}

#[tokio::test]
async fn test_power_on_when_already_on_succeeds() {
    let s = setup(PowerState::On, FakeScripts::passing()).await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-03"))
        .await
        .unwrap()
        .id;

    s.region.engine.request(id, Command::PowerOn).await.unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::New);
    assert_eq!(record.power_state, PowerState::On);
    let transition = &record.history[0];
    assert_eq!(transition.outcome, TransitionOutcome::Succeeded);
    assert_eq!(transition.attempts.len(), 1);
    assert_eq!(transition.attempts[0].outcome, AttemptOutcome::Succeeded);
    s.teardown().await;
}

#[tokio::test]
async fn test_duplicate_command_returns_pending_step() {
    let s = setup(
        PowerState::Off,
        FakeScripts::new(&[], Duration::from_millis(500)),
    )
    .await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-04"))
        .await
        .unwrap()
        .id;

    let first = s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_for_scripts(&s.region, id).await;
    let pending = machine(&s.region, id).await.in_flight().map(|st| st.id);

    let second = s.region.engine.request(id, Command::Commission).await.unwrap();
    let third = s.region.engine.request(id, Command::Commission).await.unwrap();
    assert!(second.coalesced && third.coalesced);
    assert_eq!(second.transition, first.transition);
    assert_eq!(second.step, pending);
    assert_eq!(third.step, pending);

    let busy = s.region.engine.request(id, Command::Test).await;
    assert!(matches!(busy, Err(LifecycleError::Busy { .. })));

    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Ready);
    assert_eq!(record.history.len(), 1);
    assert_eq!(s.scripts.runs.load(Ordering::SeqCst), 1);
    s.teardown().await;
}

#[tokio::test]
async fn test_abort_fails_the_transition_and_powers_off() {
    let s = setup(
        PowerState::Off,
        FakeScripts::new(&[], Duration::from_secs(30)),
    )
    .await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-05"))
        .await
        .unwrap()
        .id;

    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_for_scripts(&s.region, id).await;
    s.region.engine.request(id, Command::Abort).await.unwrap();

    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::FailedCommissioning);
    assert_eq!(s.power.state(), PowerState::Off);
    let transition = &record.history[0];
    assert_eq!(transition.outcome, TransitionOutcome::Failed);
    assert!(transition
        .attempts
        .iter()
        .any(|a| a.outcome == AttemptOutcome::Aborted));

    let nothing = s.region.engine.request(id, Command::Abort).await;
    assert!(matches!(nothing, Err(LifecycleError::NothingToAbort)));
    s.teardown().await;
}

#[tokio::test]
async fn test_mark_broken_supersedes_running_transition() {
    let s = setup(
        PowerState::Off,
        FakeScripts::new(&[], Duration::from_secs(30)),
    )
    .await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-06"))
        .await
        .unwrap()
        .id;

    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_for_scripts(&s.region, id).await;
    s.region
        .engine
        .request(
            id,
            Command::MarkBroken {
                reason: "fan failure".to_string(),
            },
        )
        .await
        .unwrap();

    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Broken);
    assert_eq!(record.broken_reason.as_deref(), Some("fan failure"));
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.history[0].outcome, TransitionOutcome::Aborted);
    assert_eq!(record.history[1].outcome, TransitionOutcome::Succeeded);

    let refused = s.region.engine.request(id, Command::Commission).await;
    assert!(matches!(refused, Err(LifecycleError::InvalidTransition { .. })));

    s.region.engine.request(id, Command::MarkFixed).await.unwrap();
    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Ready);
    assert!(record.broken_reason.is_none());
    s.teardown().await;
}

#[tokio::test]
async fn test_register_is_idempotent_and_commands_need_a_known_machine() {
    let s = setup(PowerState::Off, FakeScripts::passing()).await;
    let registration = registration(s.segment, "node-07");
    let first = s
        .region
        .engine
        .register_machine(registration.clone())
        .await
        .unwrap();
    let second = s.region.engine.register_machine(registration).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(s.region.engine.machines().await.len(), 1);

    let unknown = s
        .region
        .engine
        .request(MachineId::new(), Command::Commission)
        .await;
    assert!(matches!(unknown, Err(LifecycleError::UnknownMachine(_))));
    s.teardown().await;
}

#[tokio::test]
async fn test_stored_transition_resumes_after_restart() {
    let s = setup(PowerState::Off, FakeScripts::passing()).await;
    let id = s
        .region
        .engine
        .register_machine(registration(s.segment, "node-08"))
        .await
        .unwrap()
        .id;
    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_idle(&s.region, id).await;

    // A second engine over the same store sees the finished record.
    let engine = ironfleet_region::lifecycle::LifecycleEngine::new(
        s.region.store.clone(),
        ironfleet_region::lifecycle::RackRouter::new(
            s.region.store.clone(),
            s.region.session.clone(),
        ),
        region_config().lifecycle,
    );
    assert_eq!(engine.start().await.unwrap(), 1);
    let reloaded = engine.machine(id).await.unwrap();
    assert_eq!(reloaded.state, LifecycleState::Ready);
    assert_eq!(reloaded.history.len(), 1);
    s.teardown().await;
}

#[tokio::test]
async fn test_timed_out_script_step_is_run_again() {
    let s = setup_with(
        short_script_deadline(),
        Store::in_memory(),
        PowerState::Off,
        FakeScripts::slow_first(1, Duration::from_secs(2)),
    )
    .await;
    let id = register(&s, "node-09").await;

    s.region.engine.request(id, Command::Commission).await.unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::Ready);
    assert_eq!(s.scripts.runs.load(Ordering::SeqCst), 2);
    let scripts: Vec<_> = record.history[0]
        .attempts
        .iter()
        .filter(|a| matches!(a.kind, StepKind::RunScripts { .. }))
        .map(|a| (a.attempt, a.outcome))
        .collect();
    assert_eq!(
        scripts,
        vec![(1, AttemptOutcome::TimedOut), (2, AttemptOutcome::Succeeded)]
    );
    s.teardown().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_commissioning_with_every_attempt() {
    let s = setup_with(
        short_script_deadline(),
        Store::in_memory(),
        PowerState::Off,
        FakeScripts::new(&[], Duration::from_secs(2)),
    )
    .await;
    let id = register(&s, "node-10").await;

    s.region.engine.request(id, Command::Commission).await.unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::FailedCommissioning);
    assert_eq!(s.power.state(), PowerState::Off);
    assert_eq!(s.scripts.runs.load(Ordering::SeqCst), 2);

    let transition = &record.history[0];
    assert_eq!(transition.outcome, TransitionOutcome::Failed);
    let kinds: Vec<_> = transition.attempts.iter().map(|a| a.kind.label()).collect();
    assert_eq!(
        kinds,
        vec!["power-query", "power-on", "run-scripts", "run-scripts", "power-off"]
    );
    let scripts: Vec<_> = transition
        .attempts
        .iter()
        .filter(|a| a.kind.label() == "run-scripts")
        .collect();
    assert_eq!(scripts[0].attempt, 1);
    assert_eq!(scripts[1].attempt, 2);
    assert!(scripts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::TimedOut && a.step == scripts[0].step));
    assert!(transition
        .error
        .as_deref()
        .is_some_and(|e| e.contains("gave up after 2 attempts")));
    s.teardown().await;
}

#[tokio::test]
async fn test_allocate_then_deploy_reaches_deployed() {
    let s = setup(PowerState::Off, FakeScripts::passing()).await;
    let id = register(&s, "node-11").await;
    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_idle(&s.region, id).await;

    let ticket = s
        .region
        .engine
        .request(
            id,
            Command::Allocate {
                owner: "team-storage".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(ticket.state, LifecycleState::Allocated);
    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Allocated);
    assert_eq!(record.owner.as_deref(), Some("team-storage"));

    s.region
        .engine
        .request(
            id,
            Command::Deploy {
                image: "jammy".to_string(),
            },
        )
        .await
        .unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::Deployed);
    assert_eq!(record.owner.as_deref(), Some("team-storage"));
    assert_eq!(record.image.as_deref(), Some("jammy"));
    assert_eq!(record.power_state, PowerState::On);
    let deploy = record.history.last().unwrap();
    assert_eq!(deploy.outcome, TransitionOutcome::Succeeded);
    assert_eq!(deploy.logs.len(), 1);
    assert_eq!(deploy.logs[0].script_set, "deploy");
    assert_eq!(s.scripts.sets(), vec!["commissioning", "deploy"]);
    s.teardown().await;
}

#[tokio::test]
async fn test_failed_deploy_is_released_with_erase_back_to_ready() {
    let s = setup(PowerState::Off, FakeScripts::new(&["deploy"], Duration::ZERO)).await;
    let id = register(&s, "node-12").await;
    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_idle(&s.region, id).await;
    s.region
        .engine
        .request(
            id,
            Command::Allocate {
                owner: "team-ci".to_string(),
            },
        )
        .await
        .unwrap();
    wait_idle(&s.region, id).await;

    s.region
        .engine
        .request(
            id,
            Command::Deploy {
                image: "noble".to_string(),
            },
        )
        .await
        .unwrap();
    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::FailedDeployment);
    assert_eq!(s.power.state(), PowerState::Off);
    let deploy = record.history.last().unwrap();
    assert_eq!(deploy.outcome, TransitionOutcome::Failed);
    assert!(!deploy.logs[0].passed);

    s.region
        .engine
        .request(id, Command::Release { erase: true })
        .await
        .unwrap();
    let record = wait_idle(&s.region, id).await;

    assert_eq!(record.state, LifecycleState::Ready);
    assert!(record.owner.is_none());
    assert!(record.image.is_none());
    assert_eq!(s.power.state(), PowerState::Off);
    let release = record.history.last().unwrap();
    assert_eq!(release.outcome, TransitionOutcome::Succeeded);
    assert_eq!(release.logs.len(), 1);
    assert_eq!(release.logs[0].script_set, "erase");
    assert!(release.logs[0].passed);
    assert_eq!(s.scripts.sets(), vec!["commissioning", "deploy", "erase"]);
    s.teardown().await;
}

#[tokio::test]
async fn test_unwritable_command_is_rolled_back() {
    let backend = FlakyBackend::new();
    let s = setup_with(
        region_config(),
        Store::new(backend.clone()),
        PowerState::Off,
        FakeScripts::passing(),
    )
    .await;
    let id = register(&s, "node-13").await;

    backend.break_machine_writes();
    let refused = s.region.engine.request(id, Command::Commission).await;
    assert!(matches!(refused, Err(LifecycleError::Store(_))));
    assert!(backend.failed.load(Ordering::SeqCst) > 1);

    let record = machine(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::New);
    assert!(record.active.is_none());
    assert!(record.history.is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(s.power.actions.lock().unwrap().is_empty());
    assert_eq!(s.scripts.runs.load(Ordering::SeqCst), 0);

    backend.heal();
    s.region.engine.request(id, Command::Commission).await.unwrap();
    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Ready);
    assert_eq!(record.history.len(), 1);
    s.teardown().await;
}

#[tokio::test]
async fn test_machine_writes_are_retried() {
    let backend = FlakyBackend::new();
    let s = setup_with(
        region_config(),
        Store::new(backend.clone()),
        PowerState::Off,
        FakeScripts::new(&[], Duration::from_millis(300)),
    )
    .await;
    let id = register(&s, "node-14").await;

    backend.fail_machine_writes(2);
    s.region.engine.request(id, Command::Commission).await.unwrap();
    wait_for_scripts(&s.region, id).await;

    // The step result lands while the store is failing.
    backend.fail_machine_writes(3);
    let record = wait_idle(&s.region, id).await;
    assert_eq!(record.state, LifecycleState::Ready);
    assert_eq!(backend.failed.load(Ordering::SeqCst), 5);

    let stored = s.region.store.get_machine(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, LifecycleState::Ready);
    assert!(stored.active.is_none());
    s.teardown().await;
}

#[tokio::test]
async fn test_concurrent_registrations_create_one_machine() {
    let s = setup(PowerState::Off, FakeScripts::passing()).await;
    let registration = registration(s.segment, "node-15");
    let engine = &s.region.engine;

    let (a, b, c, d) = tokio::join!(
        engine.register_machine(registration.clone()),
        engine.register_machine(registration.clone()),
        engine.register_machine(registration.clone()),
        engine.register_machine(registration.clone()),
    );
    let records = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];
    assert!(records
        .iter()
        .all(|r| r.id == registration.id && r.created_at == records[0].created_at));
    assert_eq!(engine.machines().await.len(), 1);

    engine.request(registration.id, Command::Commission).await.unwrap();
    assert_eq!(
        wait_idle(&s.region, registration.id).await.state,
        LifecycleState::Ready
    );
    s.teardown().await;
}
