//! Rack configuration
//!
//! Every setting is a command-line flag with an environment variable
//! fallback. [`RackArgs`] is what clap parses; [`RackConfig`] is the
//! validated form the rest of the crate consumes.

use crate::agent::DEFAULT_JOURNAL_CAPACITY;
use crate::capability::RetryPolicy;
use crate::session::{PingConfig, ReconnectPolicy, SessionConfig};
use clap::Args;
use ironfleet_core::connection::ConnectionConfig;
use ironfleet_core::ids::ControllerId;
use ironfleet_core::models::SegmentCapability;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct RackArgs {
    /// Stable identity of this rack controller
    #[arg(long, env = "IRONFLEET_RACK_ID")]
    pub rack_id: ControllerId,

    /// Human-readable name used in logs and the region API
    #[arg(long, env = "IRONFLEET_RACK_NAME", default_value = "rack")]
    pub rack_name: String,

    /// Region controller addresses (comma-separated host:port)
    #[arg(long, env = "IRONFLEET_REGIONS", value_delimiter = ',', required = true)]
    pub regions: Vec<String>,

    /// Served segments as `<segment-uuid>=<service>+<service>`, separated by ';'
    #[arg(long, env = "IRONFLEET_SEGMENTS", default_value = "")]
    pub segments: String,

    /// Command run for power operations
    #[arg(long, env = "IRONFLEET_POWER_COMMAND", default_value = "ironfleet-power")]
    pub power_command: String,

    /// Command run for script sets
    #[arg(long, env = "IRONFLEET_SCRIPT_COMMAND", default_value = "ironfleet-scripts")]
    pub script_command: String,

    /// Prometheus listen address
    #[arg(long, env = "IRONFLEET_METRICS_ADDR", default_value = "0.0.0.0:9102")]
    pub metrics_addr: SocketAddr,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "IRONFLEET_RECONNECT_INITIAL_MS", default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[arg(long, env = "IRONFLEET_RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RackConfig {
    pub rack_id: ControllerId,
    pub rack_name: String,
    pub segments: Vec<SegmentCapability>,
    pub power_command: String,
    pub script_command: String,
    pub metrics_addr: SocketAddr,
    pub session: SessionConfig,
    pub power_policy: RetryPolicy,
    pub script_policy: RetryPolicy,
    pub journal_capacity: usize,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            rack_id: ControllerId::new(),
            rack_name: "rack".to_string(),
            segments: Vec::new(),
            power_command: "ironfleet-power".to_string(),
            script_command: "ironfleet-scripts".to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9102)),
            session: SessionConfig::default(),
            power_policy: RetryPolicy::power(),
            script_policy: RetryPolicy::scripts(),
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid segment list: {0}")]
    Segments(String),
    #[error("no region addresses configured")]
    NoRegions,
    #[error("reconnect delay ceiling {max_ms}ms is below the initial delay {initial_ms}ms")]
    Backoff { initial_ms: u64, max_ms: u64 },
}

/// Parse `uuid=svc+svc;uuid=svc`.
pub fn parse_segments(value: &str) -> Result<Vec<SegmentCapability>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| SegmentCapability::parse(s).map_err(ConfigError::Segments))
        .collect()
}

impl TryFrom<RackArgs> for RackConfig {
    type Error = ConfigError;

    fn try_from(args: RackArgs) -> Result<Self, Self::Error> {
        let regions: Vec<String> = args
            .regions
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        if args.reconnect_max_ms < args.reconnect_initial_ms {
            return Err(ConfigError::Backoff {
                initial_ms: args.reconnect_initial_ms,
                max_ms: args.reconnect_max_ms,
            });
        }

        let defaults = RackConfig::default();
        Ok(Self {
            rack_id: args.rack_id,
            rack_name: args.rack_name,
            segments: parse_segments(&args.segments)?,
            power_command: args.power_command,
            script_command: args.script_command,
            metrics_addr: args.metrics_addr,
            session: SessionConfig {
                regions,
                connection: ConnectionConfig::default(),
                reconnect: ReconnectPolicy {
                    initial: Duration::from_millis(args.reconnect_initial_ms),
                    max: Duration::from_millis(args.reconnect_max_ms),
                    ..ReconnectPolicy::default()
                },
                ping: PingConfig::default(),
                ..defaults.session
            },
            ..defaults
        })
    }
}
