//! Shared harness: an in-process region with real rack sessions dialing it
//! over `tokio::io::duplex`, backed by scripted fake drivers.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ironfleet_core::connection::{
    handshake, CallContext, CallHandler, Connection, ConnectionConfig, TimeoutPolicy,
};
use ironfleet_core::error::RemoteError;
use ironfleet_core::ids::{ControllerId, MachineId, SegmentId};
use ironfleet_core::models::{
    ControllerIdentity, ControllerKind, PowerAction, PowerConfig, PowerState, PowerTarget,
    ScriptOutcome, SegmentCapability, ServiceAssignment, ServiceKind,
};
use ironfleet_core::protocol::{Reply, Request};
use ironfleet_core::version::PROTOCOL_REVISION;
use ironfleet_rack::capability::{
    DriverError, DriverErrorKind, PowerControl, PowerDriver, RetryPolicy, ScriptControl,
    ScriptRunner,
};
use ironfleet_rack::session::{BoxedTransport, Connector, PingConfig, ReconnectPolicy, SessionConfig};
use ironfleet_rack::{Agent, RackSession, ServiceHost, SessionDeps};
use ironfleet_region::election::{ElectionConfig, ElectionStatus, GetAssignments};
use ironfleet_region::lifecycle::{LifecycleConfig, MachineRecord, MachineRegistration};
use ironfleet_region::session::{Acceptor, HealthConfig};
use ironfleet_region::store::{Backend, MemoryBackend, RawEntry, Store, StoreError, MACHINES_PREFIX};
use ironfleet_region::{Region, RegionConfig};
use kameo::prelude::*;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn region_config() -> RegionConfig {
    RegionConfig {
        auto_enroll: true,
        connection: ConnectionConfig {
            handshake_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
            timeouts: TimeoutPolicy::new(3, Duration::from_secs(60)),
            drain_grace: Duration::from_millis(200),
        },
        health: HealthConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(1),
        },
        election: ElectionConfig {
            notify_timeout: Duration::from_secs(1),
            notify_backoff_initial: Duration::from_millis(20),
            notify_backoff_max: Duration::from_millis(200),
            ..ElectionConfig::default()
        },
        lifecycle: LifecycleConfig {
            max_step_attempts: 2,
            step_retry_delay: Duration::from_millis(20),
            power_deadline: Duration::from_secs(2),
            script_deadline: Duration::from_secs(10),
            script_poll_interval: Duration::from_millis(20),
            store_retry_initial: Duration::from_millis(10),
            store_retry_max_elapsed: Duration::from_millis(200),
            ..LifecycleConfig::default()
        },
        stop_timeout: Duration::from_secs(1),
        ..RegionConfig::default()
    }
}

pub async fn start_region(config: RegionConfig) -> Region {
    start_region_with(config, Store::in_memory()).await
}

pub async fn start_region_with(config: RegionConfig, store: Store) -> Region {
    Region::start(config, store).await.expect("region starts")
}

/// Memory backend whose machine writes fail with a transient error while
/// `failing_writes` is above zero. Each failed write counts it down.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failing_writes: AtomicUsize,
    pub failed: AtomicUsize,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` machine writes.
    pub fn fail_machine_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail every machine write until [`FlakyBackend::heal`].
    pub fn break_machine_writes(&self) {
        self.fail_machine_writes(usize::MAX);
    }

    pub fn heal(&self) {
        self.fail_machine_writes(0);
    }

    fn should_fail(&self, key: &str) -> bool {
        if !key.starts_with(MACHINES_PREFIX) {
            return false;
        }
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        failing
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RawEntry>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        if self.should_fail(key) {
            return Err(StoreError::Unavailable("etcd leader lost".to_string()));
        }
        self.inner.put(key, value).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: String,
    ) -> Result<bool, StoreError> {
        if self.should_fail(key) {
            return Err(StoreError::Unavailable("etcd leader lost".to_string()));
        }
        self.inner.compare_and_put(key, expected_revision, value).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.inner.health().await
    }
}

/// Dials the region's acceptor over an in-memory pipe.
pub struct RegionConnector {
    acceptor: Acceptor,
}

impl RegionConnector {
    pub fn new(acceptor: Acceptor) -> Self {
        Self { acceptor }
    }
}

#[async_trait]
impl Connector for RegionConnector {
    async fn connect(&self, _address: &str) -> std::io::Result<BoxedTransport> {
        let (rack_io, region_io) = tokio::io::duplex(64 * 1024);
        let acceptor = self.acceptor.clone();
        tokio::spawn(async move {
            let _ = acceptor.accept(region_io, "duplex").await;
        });
        Ok(Box::new(rack_io))
    }
}

/// BMC that remembers its state and answers `on` with "already on".
pub struct FakePower {
    state: Mutex<PowerState>,
    pub actions: Mutex<Vec<PowerAction>>,
}

impl FakePower {
    pub fn new(initial: PowerState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            actions: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> PowerState {
        *self.state.lock().unwrap()
    }
}

#[async_trait]
impl PowerDriver for FakePower {
    async fn query(&self, _target: &PowerTarget) -> Result<PowerState, DriverError> {
        Ok(self.state())
    }

    async fn set_power(&self, _target: &PowerTarget, action: PowerAction) -> Result<(), DriverError> {
        self.actions.lock().unwrap().push(action);
        let mut state = self.state.lock().unwrap();
        match action {
            PowerAction::On if *state == PowerState::On => Err(DriverError::new(
                DriverErrorKind::AlreadyInState,
                "chassis already on",
            )),
            PowerAction::On | PowerAction::Cycle => {
                *state = PowerState::On;
                Ok(())
            }
            PowerAction::Off => {
                *state = PowerState::Off;
                Ok(())
            }
        }
    }
}

/// Script sets pass unless listed in `failing`. The first `slow_runs` runs
/// take `delay`, later ones return at once.
pub struct FakeScripts {
    failing: Vec<String>,
    delay: Duration,
    slow_runs: usize,
    pub runs: AtomicUsize,
    /// Script sets in the order they were started.
    pub sets: Mutex<Vec<String>>,
}

impl FakeScripts {
    pub fn passing() -> Arc<Self> {
        Self::new(&[], Duration::ZERO)
    }

    pub fn new(failing: &[&str], delay: Duration) -> Arc<Self> {
        Self::build(failing, delay, usize::MAX)
    }

    /// Passing scripts whose first `slow_runs` runs hang for `delay`.
    pub fn slow_first(slow_runs: usize, delay: Duration) -> Arc<Self> {
        Self::build(&[], delay, slow_runs)
    }

    fn build(failing: &[&str], delay: Duration, slow_runs: usize) -> Arc<Self> {
        Arc::new(Self {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            delay,
            slow_runs,
            runs: AtomicUsize::new(0),
            sets: Mutex::new(Vec::new()),
        })
    }

    pub fn sets(&self) -> Vec<String> {
        self.sets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptRunner for FakeScripts {
    async fn run_scripts(
        &self,
        _target: &PowerTarget,
        script_set: &str,
    ) -> Result<ScriptOutcome, DriverError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        self.sets.lock().unwrap().push(script_set.to_string());
        if run < self.slow_runs {
            tokio::time::sleep(self.delay).await;
        }
        let passed = !self.failing.iter().any(|s| s == script_set);
        let mut facts = std::collections::BTreeMap::new();
        if passed && script_set == "commissioning" {
            facts.insert("cpu_count".to_string(), "16".to_string());
        }
        Ok(ScriptOutcome {
            passed,
            logs: format!("{script_set}: {}", if passed { "ok" } else { "FAILED" }),
            exit_code: Some(if passed { 0 } else { 1 }),
            facts,
        })
    }
}

pub struct FakeRack {
    pub identity: ControllerIdentity,
    pub session: RackSession,
    pub services: Arc<ServiceHost>,
}

impl FakeRack {
    pub fn id(&self) -> ControllerId {
        self.identity.id
    }
}

pub fn rack_identity(name: &str, segment: SegmentId) -> ControllerIdentity {
    ControllerIdentity {
        id: ControllerId::new(),
        kind: ControllerKind::Rack,
        name: name.to_string(),
        started_at: Utc::now(),
        version: "test".to_string(),
        protocol: PROTOCOL_REVISION,
        segments: vec![SegmentCapability::new(
            segment,
            [ServiceKind::Boot, ServiceKind::DhcpV4],
        )],
    }
}

/// Start a real rack session for `identity` against `region`.
pub fn connect_rack(
    region: &Region,
    identity: ControllerIdentity,
    power: Arc<FakePower>,
    scripts: Arc<FakeScripts>,
) -> FakeRack {
    let services = Arc::new(ServiceHost::new(&identity.segments));
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let policy = RetryPolicy {
        max_attempts: 2,
        attempt_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(10),
    };
    let agent = Arc::new(Agent::new(
        PowerControl::new(power, policy),
        ScriptControl::new(scripts, policy),
        services.clone(),
        64,
        outbox_tx,
    ));

    let config = SessionConfig {
        regions: vec!["region:5250".to_string()],
        connection: ConnectionConfig {
            drain_grace: Duration::from_millis(200),
            ..ConnectionConfig::default()
        },
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ping: PingConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(1),
            report_every: 0,
        },
        ..SessionConfig::default()
    };
    let session = RackSession::start(
        config,
        SessionDeps {
            local: identity.clone(),
            connector: Arc::new(RegionConnector::new(region.acceptor.clone())),
            handler: agent,
            services: services.clone(),
            outbox: outbox_rx,
        },
    );
    FakeRack {
        identity,
        session,
        services,
    }
}

/// Rack whose handler never answers. Connected directly, without a session,
/// so nothing reconnects once the region gives up on it.
pub struct SilentHandler;

#[async_trait]
impl CallHandler for SilentHandler {
    async fn handle(&self, _ctx: CallContext, _request: Request) -> Result<Reply, RemoteError> {
        std::future::pending().await
    }
}

pub async fn connect_silent_rack(region: &Region, identity: ControllerIdentity) -> Connection {
    let (rack_io, region_io) = tokio::io::duplex(64 * 1024);
    let acceptor = region.acceptor.clone();
    tokio::spawn(async move {
        let _ = acceptor.accept(region_io, "duplex").await;
    });

    let mut transport = handshake::framed(rack_io);
    let peer = handshake::initiate(&mut transport, &identity, Duration::from_secs(2))
        .await
        .expect("region welcomes the rack");
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    Connection::spawn(
        transport,
        identity,
        peer,
        ConnectionConfig::default(),
        Arc::new(SilentHandler),
        events_tx,
    )
}

pub fn registration(segment: SegmentId, hostname: &str) -> MachineRegistration {
    MachineRegistration {
        id: MachineId::new(),
        hostname: hostname.to_string(),
        segment,
        rack_of_record: None,
        power: PowerConfig::default(),
    }
}

pub async fn assignment(region: &Region, segment: SegmentId, service: ServiceKind) -> ServiceAssignment {
    region
        .store
        .load_assignment(segment, service)
        .await
        .expect("store readable")
        .value
}

pub async fn election_status(region: &Region) -> ElectionStatus {
    region
        .election
        .ask(GetAssignments)
        .send()
        .await
        .expect("election status")
}

pub async fn machine(region: &Region, id: MachineId) -> MachineRecord {
    region.engine.machine(id).await.expect("machine exists")
}

/// Wait until the segment's boot service is confirmed by `owner`.
pub async fn wait_for_owner(region: &Region, segment: SegmentId, owner: ControllerId) {
    eventually("boot owner confirmed", || async {
        let current = assignment(region, segment, ServiceKind::Boot).await;
        current.owner == Some(owner) && current.confirmed
    })
    .await;
}

/// Wait until the machine has no active transition.
pub async fn wait_idle(region: &Region, id: MachineId) -> MachineRecord {
    eventually("transition finished", || async {
        machine(region, id).await.active.is_none()
    })
    .await;
    machine(region, id).await
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
