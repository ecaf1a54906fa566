//! Hardware capabilities
//!
//! The rack acts on machines through two narrow interfaces. Vendor specifics
//! (IPMI, Redfish, PDUs, script transports) live behind them.
//!
//! - [`PowerDriver`]: query/on/off/cycle a BMC
//! - [`ScriptRunner`]: run a named script set and report pass/fail with logs
//!
//! [`policy`] wraps both with per-attempt timeouts and retries; [`exec`]
//! provides drivers that shell out to operator-supplied commands.

pub mod exec;
pub mod policy;

use async_trait::async_trait;
use ironfleet_core::error::{Classify, ErrorClass, RemoteError};
use ironfleet_core::models::{PowerAction, PowerState, PowerTarget, ScriptOutcome};
use strum::Display;

pub use exec::{ExecPowerDriver, ExecScriptRunner};
pub use policy::{PowerControl, RetryPolicy, ScriptControl};

/// How a driver call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DriverErrorKind {
    /// BMC unreachable or the connection dropped.
    Transport,
    /// BMC busy or power supply settling.
    Busy,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Requested state already holds. Treated as success.
    AlreadyInState,
    BadCredentials,
    Unsupported,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::Transport | DriverErrorKind::Busy | DriverErrorKind::Timeout
        )
    }
}

impl Classify for DriverError {
    fn class(&self) -> ErrorClass {
        match self.kind {
            DriverErrorKind::Transport | DriverErrorKind::Timeout => ErrorClass::TransientTransport,
            DriverErrorKind::Busy => ErrorClass::TransientHardware,
            DriverErrorKind::AlreadyInState => ErrorClass::Coordination,
            DriverErrorKind::BadCredentials
            | DriverErrorKind::Unsupported
            | DriverErrorKind::Failed => ErrorClass::CapabilityPermanent,
        }
    }
}

impl From<DriverError> for RemoteError {
    fn from(err: DriverError) -> Self {
        RemoteError::new(err.class(), err.to_string())
    }
}

/// BMC power control.
#[async_trait]
pub trait PowerDriver: Send + Sync + 'static {
    async fn query(&self, target: &PowerTarget) -> Result<PowerState, DriverError>;

    /// Drivers may report a no-op as `Ok(())` or as `AlreadyInState`.
    async fn set_power(&self, target: &PowerTarget, action: PowerAction)
        -> Result<(), DriverError>;
}

/// Executes a script set against a machine over its own out-of-band channel.
///
/// A script set that ran and failed is `Ok` with `passed == false`; `Err` is
/// reserved for failing to run it at all.
#[async_trait]
pub trait ScriptRunner: Send + Sync + 'static {
    async fn run_scripts(
        &self,
        target: &PowerTarget,
        script_set: &str,
    ) -> Result<ScriptOutcome, DriverError>;
}
