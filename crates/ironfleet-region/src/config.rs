//! Region configuration
//!
//! Flags with environment fallbacks, parsed by clap into [`RegionArgs`] and
//! validated into [`RegionConfig`].

use crate::election::ElectionConfig;
use crate::lifecycle::LifecycleConfig;
use crate::session::HealthConfig;
use crate::store::EtcdOptions;
use clap::{Args, ValueEnum};
use ironfleet_core::connection::{ConnectionConfig, TimeoutPolicy};
use ironfleet_core::ids::ControllerId;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Process-local store; state is lost on restart
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Args)]
pub struct RegionArgs {
    /// Stable identity of this region controller
    #[arg(long, env = "IRONFLEET_REGION_ID")]
    pub region_id: Option<ControllerId>,

    /// Human-readable name announced to racks
    #[arg(long, env = "IRONFLEET_REGION_NAME", default_value = "region")]
    pub region_name: String,

    /// Address racks connect to
    #[arg(long, env = "IRONFLEET_LISTEN_ADDR", default_value = "0.0.0.0:5250")]
    pub listen_addr: SocketAddr,

    /// Operator HTTP API address
    #[arg(long, env = "IRONFLEET_HTTP_ADDR", default_value = "0.0.0.0:5240")]
    pub http_addr: SocketAddr,

    #[arg(long, env = "IRONFLEET_STORE", value_enum, default_value_t = StoreKind::Etcd)]
    pub store: StoreKind,

    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub etcd_endpoints: Vec<String>,

    /// Default deadline for calls to racks, in seconds
    #[arg(long, env = "IRONFLEET_CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Timeouts within the window that close a rack connection
    #[arg(long, env = "IRONFLEET_MAX_TIMEOUTS", default_value_t = 3)]
    pub max_timeouts: u32,

    /// Timeout window, in seconds
    #[arg(long, env = "IRONFLEET_TIMEOUT_WINDOW_SECS", default_value_t = 60)]
    pub timeout_window_secs: u64,

    /// Dispatch attempts per lifecycle step
    #[arg(long, env = "IRONFLEET_STEP_ATTEMPTS", default_value_t = 3)]
    pub step_attempts: u32,

    /// Accept racks missing from the controller directory
    #[arg(long, env = "IRONFLEET_AUTO_ENROLL", default_value_t = false)]
    pub auto_enroll: bool,
}

#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub region_id: ControllerId,
    pub region_name: String,
    pub listen_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub store: StoreKind,
    pub etcd: EtcdOptions,
    pub connection: ConnectionConfig,
    pub health: HealthConfig,
    pub election: ElectionConfig,
    pub lifecycle: LifecycleConfig,
    /// Deadline of the StopServing calls sent for stale grants.
    pub stop_timeout: Duration,
    pub auto_enroll: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            region_id: ControllerId::new(),
            region_name: "region".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5250)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5240)),
            store: StoreKind::Etcd,
            etcd: EtcdOptions::default(),
            connection: ConnectionConfig::default(),
            health: HealthConfig::default(),
            election: ElectionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            stop_timeout: Duration::from_secs(10),
            auto_enroll: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no etcd endpoints configured")]
    NoEndpoints,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl TryFrom<RegionArgs> for RegionConfig {
    type Error = ConfigError;

    fn try_from(args: RegionArgs) -> Result<Self, Self::Error> {
        let endpoints: Vec<String> = args
            .etcd_endpoints
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if args.store == StoreKind::Etcd && endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if args.call_timeout_secs == 0 {
            return Err(ConfigError::Zero("call timeout"));
        }
        if args.max_timeouts == 0 {
            return Err(ConfigError::Zero("max timeouts"));
        }
        if args.step_attempts == 0 {
            return Err(ConfigError::Zero("step attempts"));
        }

        let defaults = RegionConfig::default();
        Ok(Self {
            region_id: args.region_id.unwrap_or(defaults.region_id),
            region_name: args.region_name,
            listen_addr: args.listen_addr,
            http_addr: args.http_addr,
            store: args.store,
            etcd: EtcdOptions {
                endpoints,
                ..defaults.etcd
            },
            connection: ConnectionConfig {
                call_timeout: Duration::from_secs(args.call_timeout_secs),
                timeouts: TimeoutPolicy::new(
                    args.max_timeouts,
                    Duration::from_secs(args.timeout_window_secs),
                ),
                ..defaults.connection
            },
            lifecycle: LifecycleConfig {
                max_step_attempts: args.step_attempts,
                ..defaults.lifecycle
            },
            auto_enroll: args.auto_enroll,
            ..defaults
        })
    }
}
