//! Retry and timeout policy around the raw capabilities
//!
//! Every primitive call gets a per-attempt timeout. Timeouts and retryable
//! error kinds are retried with linear backoff (`backoff_base × attempt`) up
//! to `max_attempts`; anything else fails on the spot.

use super::{DriverError, DriverErrorKind, PowerDriver, ScriptRunner};
use crate::observability::metrics;
use ironfleet_core::models::{PowerAction, PowerState, PowerTarget, ScriptOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// BMC calls: short attempts, a few retries.
    pub fn power() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
        }
    }

    /// Script sets can legitimately run for a long time.
    pub fn scripts() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(60 * 60),
            backoff_base: Duration::from_secs(5),
        }
    }

    /// Upper bound on the time a wrapped call can take, backoff included.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: u32 = (1..attempts).sum();
        self.attempt_timeout * attempts + self.backoff_base * backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::power()
    }
}

/// Run `attempt` under `policy`. `op` labels logs and metrics.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut attempt: F,
) -> Result<T, DriverError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for n in 1..=max_attempts {
        let err = match tokio::time::timeout(policy.attempt_timeout, attempt(n)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_retryable() => return Err(err),
            Ok(Err(err)) => err,
            Err(_) => DriverError::new(
                DriverErrorKind::Timeout,
                format!("{op} attempt {n} exceeded {:?}", policy.attempt_timeout),
            ),
        };

        if n < max_attempts {
            let delay = policy.backoff_base * n;
            debug!(op, attempt = n, error = %err, delay_ms = delay.as_millis() as u64, "Retrying driver call");
            metrics::record_driver_retry(op, err.kind);
            tokio::time::sleep(delay).await;
        } else {
            warn!(op, attempts = n, error = %err, "Driver call failed after all attempts");
        }
        last_error = Some(err);
    }

    Err(last_error.unwrap_or_else(|| DriverError::new(DriverErrorKind::Failed, "no attempts made")))
}

/// [`PowerDriver`] with policy applied.
#[derive(Clone)]
pub struct PowerControl {
    driver: Arc<dyn PowerDriver>,
    policy: RetryPolicy,
}

impl PowerControl {
    pub fn new(driver: Arc<dyn PowerDriver>, policy: RetryPolicy) -> Self {
        Self { driver, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn query(&self, target: &PowerTarget) -> Result<PowerState, DriverError> {
        with_retry(&self.policy, "power_query", |_| self.driver.query(target)).await
    }

    /// Apply `action` and return the state the machine is now in. Requesting a
    /// state that already holds succeeds whichever way the driver reports it.
    pub async fn set_power(
        &self,
        target: &PowerTarget,
        action: PowerAction,
    ) -> Result<PowerState, DriverError> {
        let op = match action {
            PowerAction::On => "power_on",
            PowerAction::Off => "power_off",
            PowerAction::Cycle => "power_cycle",
        };
        match with_retry(&self.policy, op, |_| self.driver.set_power(target, action)).await {
            Ok(()) => Ok(action.resulting_state()),
            Err(err) if err.kind == DriverErrorKind::AlreadyInState => {
                debug!(machine_id = %target.machine, action = %action, "Machine already in requested power state");
                Ok(action.resulting_state())
            }
            Err(err) => Err(err),
        }
    }
}

/// [`ScriptRunner`] with policy applied.
#[derive(Clone)]
pub struct ScriptControl {
    runner: Arc<dyn ScriptRunner>,
    policy: RetryPolicy,
}

impl ScriptControl {
    pub fn new(runner: Arc<dyn ScriptRunner>, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run_scripts(
        &self,
        target: &PowerTarget,
        script_set: &str,
    ) -> Result<ScriptOutcome, DriverError> {
        with_retry(&self.policy, "run_scripts", |_| {
            self.runner.run_scripts(target, script_set)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ironfleet_core::ids::MachineId;
    use ironfleet_core::models::PowerConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted results, then succeeds.
    struct ScriptedDriver {
        results: Mutex<VecDeque<Result<(), DriverError>>>,
        calls: AtomicU32,
        hang: bool,
    }

    impl ScriptedDriver {
        fn new(results: Vec<Result<(), DriverError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl PowerDriver for ScriptedDriver {
        async fn query(&self, _target: &PowerTarget) -> Result<PowerState, DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PowerState::Off)
        }

        async fn set_power(
            &self,
            _target: &PowerTarget,
            _action: PowerAction,
        ) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn target() -> PowerTarget {
        PowerTarget {
            machine: MachineId::new(),
            power: PowerConfig::default(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_bmc_is_retried_with_linear_backoff() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Err(DriverError::new(DriverErrorKind::Busy, "settling")),
            Err(DriverError::new(DriverErrorKind::Transport, "reset by peer")),
        ]));
        let control = PowerControl::new(driver.clone(), policy());

        let started = Instant::now();
        let state = control.set_power(&target(), PowerAction::On).await.unwrap();

        assert_eq!(state, PowerState::On);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_credentials_fail_immediately() {
        let driver = Arc::new(ScriptedDriver::new(vec![Err(DriverError::new(
            DriverErrorKind::BadCredentials,
            "auth failed",
        ))]));
        let control = PowerControl::new(driver.clone(), policy());

        let err = control
            .set_power(&target(), PowerAction::Off)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::BadCredentials);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_on_is_success() {
        let driver = Arc::new(ScriptedDriver::new(vec![Err(DriverError::new(
            DriverErrorKind::AlreadyInState,
            "chassis already on",
        ))]));
        let control = PowerControl::new(driver.clone(), policy());

        let state = control.set_power(&target(), PowerAction::On).await.unwrap();
        assert_eq!(state, PowerState::On);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_driver_times_out_each_attempt() {
        let driver = Arc::new(ScriptedDriver::hanging());
        let control = PowerControl::new(driver.clone(), policy());

        let started = Instant::now();
        let err = control
            .set_power(&target(), PowerAction::Cycle)
            .await
            .unwrap_err();

        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30 + 1 + 2));
    }

    #[test]
    fn test_worst_case_budget() {
        assert_eq!(policy().worst_case(), Duration::from_secs(33));
    }
}
