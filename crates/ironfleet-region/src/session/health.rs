//! Periodic rack ping
//!
//! Pings every registered rack on a fixed interval. Each timeout counts
//! against the connection's timeout window, so a rack that stops answering
//! is closed (and its services re-elected) even when nothing else is sent
//! to it.

use super::{broadcast, RegionSession};
use chrono::Utc;
use ironfleet_core::protocol::{Reply, Request};
use kameo::prelude::*;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }
}

pub fn spawn_health_loop(
    session: ActorRef<RegionSession>,
    config: HealthConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            sequence += 1;

            let results = broadcast(
                &session,
                Request::Ping {
                    sent_at: Utc::now(),
                },
                config.timeout,
            )
            .await;

            let mut failed = 0usize;
            for (rack, result) in &results {
                match result {
                    Ok(Reply::Pong { .. }) => {}
                    Ok(other) => {
                        failed += 1;
                        warn!(rack_id = %rack, reply = ?other, "Unexpected ping reply");
                    }
                    Err(e) => {
                        failed += 1;
                        debug!(rack_id = %rack, error = %e, "Rack ping failed");
                    }
                }
            }
            trace!(
                sequence = sequence,
                racks = results.len(),
                failed = failed,
                "Ping round complete"
            );
        }
    })
}
