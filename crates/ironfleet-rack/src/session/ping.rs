//! Per-connection ping loop
//!
//! Keeps RTT statistics fresh and feeds the connection's timeout budget, so a
//! stalled region is detected even when no other calls are flowing. Every
//! `report_every` rounds the rack also reports its served grants.

use crate::services::ServiceHost;
use chrono::Utc;
use ironfleet_core::connection::Connection;
use ironfleet_core::models::ConnectionHealth;
use ironfleet_core::protocol::{Reply, Request};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct PingConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Report served grants every N rounds (0 = only on connect).
    pub report_every: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            report_every: 6,
        }
    }
}

pub fn spawn_ping_loop(
    connection: Connection,
    services: Arc<ServiceHost>,
    config: PingConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0u64;

        report_serving(&connection, &services, config.timeout).await;

        loop {
            tokio::select! {
                _ = connection.closed() => break,
                _ = interval.tick() => {}
            }
            match connection.health() {
                ConnectionHealth::Established => {}
                ConnectionHealth::Closed => break,
                _ => continue,
            }
            sequence += 1;

            let sent_at = Utc::now();
            match connection.call(Request::Ping { sent_at }, config.timeout).await {
                Ok(Reply::Pong { .. }) => {
                    let rtt_ms = (Utc::now() - sent_at).num_milliseconds();
                    trace!(
                        region = %connection.peer().name,
                        sequence = sequence,
                        rtt_ms = rtt_ms,
                        "Ping/pong successful"
                    );
                }
                Ok(other) => {
                    warn!(region = %connection.peer().name, reply = ?other, "Unexpected ping reply");
                }
                Err(e) => {
                    warn!(
                        region = %connection.peer().name,
                        sequence = sequence,
                        error = %e,
                        "Ping failed"
                    );
                }
            }

            if config.report_every > 0 && sequence % config.report_every == 0 {
                report_serving(&connection, &services, config.timeout).await;
            }
        }

        debug!(region = %connection.peer().name, "Ping loop finished");
    })
}

async fn report_serving(connection: &Connection, services: &ServiceHost, timeout: Duration) {
    let grants = services.grants();
    if let Err(e) = connection
        .call(Request::ReportServing { grants }, timeout)
        .await
    {
        debug!(region = %connection.peer().name, error = %e, "Serving report failed");
    }
}
