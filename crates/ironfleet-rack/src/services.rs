//! Served network services
//!
//! Tracks which (segment, service) grants this rack currently acts on. The
//! served set is published on a `watch` channel for whatever supervises the
//! actual DHCP/TFTP/NTP daemons.
//!
//! Rules:
//! - `start` is idempotent for the same epoch and refuses an older epoch
//! - `stop` only removes a grant whose epoch is not newer than the request
//! - losing the connection to the granting region drops its grants at once,
//!   without waiting for an explicit stop

use crate::observability::{events, metrics};
use chrono::{DateTime, Utc};
use ironfleet_core::error::{ErrorClass, RemoteError};
use ironfleet_core::ids::{ConnectionId, ControllerId, SegmentId};
use ironfleet_core::models::{SegmentCapability, ServiceKind};
use ironfleet_core::protocol::ServingGrant;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct ActiveGrant {
    epoch: u64,
    region: ControllerId,
    connection: ConnectionId,
    since: DateTime<Utc>,
}

/// Result of a `StartServing` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// Epoch now being served for the pair.
    pub epoch: u64,
    /// False when the request carried an epoch older than the one held.
    pub accepted: bool,
}

pub struct ServiceHost {
    capabilities: BTreeMap<SegmentId, BTreeSet<ServiceKind>>,
    grants: Mutex<HashMap<(SegmentId, ServiceKind), ActiveGrant>>,
    published: watch::Sender<Vec<ServingGrant>>,
}

impl ServiceHost {
    pub fn new(capabilities: &[SegmentCapability]) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            capabilities: capabilities
                .iter()
                .map(|c| (c.segment, c.services.clone()))
                .collect(),
            grants: Mutex::new(HashMap::new()),
            published,
        }
    }

    /// Receive every change to the served set.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ServingGrant>> {
        self.published.subscribe()
    }

    pub fn grants(&self) -> Vec<ServingGrant> {
        self.published.borrow().clone()
    }

    pub fn is_serving(&self, segment: SegmentId, service: ServiceKind) -> bool {
        self.lock().contains_key(&(segment, service))
    }

    pub fn start(
        &self,
        segment: SegmentId,
        service: ServiceKind,
        epoch: u64,
        region: ControllerId,
        connection: ConnectionId,
    ) -> Result<StartOutcome, RemoteError> {
        let capable = self
            .capabilities
            .get(&segment)
            .is_some_and(|services| services.contains(&service));
        if !capable {
            return Err(RemoteError::new(
                ErrorClass::CapabilityPermanent,
                format!("not configured to serve {service} on segment {segment}"),
            ));
        }

        let mut grants = self.lock();
        if let Some(existing) = grants.get_mut(&(segment, service)) {
            if existing.epoch > epoch {
                return Ok(StartOutcome {
                    epoch: existing.epoch,
                    accepted: false,
                });
            }
            if existing.epoch == epoch {
                // Redelivery; follow the region that sent it most recently.
                existing.region = region;
                existing.connection = connection;
                return Ok(StartOutcome {
                    epoch,
                    accepted: true,
                });
            }
        }

        grants.insert(
            (segment, service),
            ActiveGrant {
                epoch,
                region,
                connection,
                since: Utc::now(),
            },
        );
        self.publish(&grants);
        drop(grants);

        events::service_started(&segment, service, epoch, &region);
        Ok(StartOutcome {
            epoch,
            accepted: true,
        })
    }

    /// Returns true when a grant was removed.
    pub fn stop(&self, segment: SegmentId, service: ServiceKind, epoch: u64) -> bool {
        let mut grants = self.lock();
        let removed = match grants.get(&(segment, service)) {
            Some(existing) if existing.epoch <= epoch => {
                grants.remove(&(segment, service));
                true
            }
            _ => false,
        };
        if removed {
            self.publish(&grants);
            drop(grants);
            events::service_stopped(&segment, service, epoch, "stop requested");
        }
        removed
    }

    /// Self-demote everything granted over `connection`.
    pub fn connection_lost(&self, connection: ConnectionId) -> Vec<ServingGrant> {
        let mut grants = self.lock();
        let lost: Vec<_> = grants
            .iter()
            .filter(|(_, grant)| grant.connection == connection)
            .map(|((segment, service), grant)| ServingGrant {
                segment: *segment,
                service: *service,
                epoch: grant.epoch,
            })
            .collect();
        if lost.is_empty() {
            return lost;
        }
        for grant in &lost {
            grants.remove(&(grant.segment, grant.service));
        }
        self.publish(&grants);
        drop(grants);

        for grant in &lost {
            events::service_stopped(
                &grant.segment,
                grant.service,
                grant.epoch,
                "granting region connection lost",
            );
        }
        lost
    }

    /// How long the pair has been served, if it is.
    pub fn serving_since(&self, segment: SegmentId, service: ServiceKind) -> Option<DateTime<Utc>> {
        self.lock().get(&(segment, service)).map(|g| g.since)
    }

    fn publish(&self, grants: &HashMap<(SegmentId, ServiceKind), ActiveGrant>) {
        let mut served: Vec<_> = grants
            .iter()
            .map(|((segment, service), grant)| ServingGrant {
                segment: *segment,
                service: *service,
                epoch: grant.epoch,
            })
            .collect();
        served.sort_by_key(|g| (g.segment, g.service));
        metrics::set_served_services(served.len());
        self.published.send_replace(served);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(SegmentId, ServiceKind), ActiveGrant>> {
        self.grants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(segment: SegmentId) -> ServiceHost {
        ServiceHost::new(&[SegmentCapability::new(
            segment,
            [ServiceKind::DhcpV4, ServiceKind::Boot],
        )])
    }

    #[test]
    fn test_start_is_idempotent() {
        let segment = SegmentId::new();
        let host = host(segment);
        let region = ControllerId::new();
        let conn = ConnectionId::new();

        let first = host.start(segment, ServiceKind::Boot, 2, region, conn).unwrap();
        let since = host.serving_since(segment, ServiceKind::Boot);
        let again = host.start(segment, ServiceKind::Boot, 2, region, conn).unwrap();
        assert_eq!(first, again);
        assert!(since.is_some());
        assert_eq!(host.serving_since(segment, ServiceKind::Boot), since);
        assert!(first.accepted);
        assert_eq!(host.grants().len(), 1);
    }

    #[test]
    fn test_stale_epoch_is_refused() {
        let segment = SegmentId::new();
        let host = host(segment);
        let region = ControllerId::new();
        let conn = ConnectionId::new();

        host.start(segment, ServiceKind::Boot, 5, region, conn).unwrap();
        let stale = host.start(segment, ServiceKind::Boot, 4, region, conn).unwrap();
        assert_eq!(
            stale,
            StartOutcome {
                epoch: 5,
                accepted: false
            }
        );

        // An old stop does not tear down the newer grant either.
        assert!(!host.stop(segment, ServiceKind::Boot, 4));
        assert!(host.is_serving(segment, ServiceKind::Boot));
        assert!(host.stop(segment, ServiceKind::Boot, 5));
        assert!(!host.is_serving(segment, ServiceKind::Boot));
    }

    #[test]
    fn test_unadvertised_service_is_rejected() {
        let segment = SegmentId::new();
        let host = host(segment);
        let err = host
            .start(segment, ServiceKind::Ntp, 1, ControllerId::new(), ConnectionId::new())
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::CapabilityPermanent);

        let other = SegmentId::new();
        assert!(host
            .start(other, ServiceKind::Boot, 1, ControllerId::new(), ConnectionId::new())
            .is_err());
    }

    #[test]
    fn test_connection_loss_self_demotes_only_that_regions_grants() {
        let segment = SegmentId::new();
        let host = host(segment);
        let lost_conn = ConnectionId::new();
        let kept_conn = ConnectionId::new();

        host.start(segment, ServiceKind::Boot, 1, ControllerId::new(), lost_conn).unwrap();
        host.start(segment, ServiceKind::DhcpV4, 1, ControllerId::new(), kept_conn).unwrap();

        let mut watcher = host.subscribe();
        let dropped = host.connection_lost(lost_conn);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].service, ServiceKind::Boot);

        assert!(watcher.has_changed().unwrap());
        let served = watcher.borrow_and_update().clone();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].service, ServiceKind::DhcpV4);

        assert!(host.connection_lost(lost_conn).is_empty());
    }
}
