//! Requests racks send to the region.

use super::{route, RegionSession};
use crate::observability::events;
use crate::store::Store;
use async_trait::async_trait;
use ironfleet_core::connection::{CallContext, CallHandler};
use ironfleet_core::error::{ErrorClass, RemoteError};
use ironfleet_core::protocol::{Reply, Request, ServingGrant};
use kameo::prelude::*;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RegionHandler {
    store: Store,
    session: ActorRef<RegionSession>,
    stop_timeout: Duration,
}

impl RegionHandler {
    pub fn new(store: Store, session: ActorRef<RegionSession>, stop_timeout: Duration) -> Self {
        Self {
            store,
            session,
            stop_timeout,
        }
    }

    /// Grants the rack holds that the stored assignments no longer back.
    async fn stale_grants(
        &self,
        ctx: &CallContext,
        grants: &[ServingGrant],
    ) -> Result<Vec<ServingGrant>, RemoteError> {
        let mut stale = Vec::new();
        for grant in grants {
            let current = self
                .store
                .load_assignment(grant.segment, grant.service)
                .await
                .map_err(|e| RemoteError::new(ErrorClass::TransientTransport, e.to_string()))?
                .value;

            let backed = current.owner == Some(ctx.peer.id) && current.epoch == grant.epoch;
            if backed {
                continue;
            }
            if grant.epoch > current.epoch {
                warn!(
                    rack_id = %ctx.peer.id,
                    segment_id = %grant.segment,
                    service = %grant.service,
                    claimed_epoch = grant.epoch,
                    stored_epoch = current.epoch,
                    "Rack claims an epoch newer than the stored assignment"
                );
                continue;
            }
            events::stale_claim_discarded(
                &grant.segment.to_string(),
                &grant.service.to_string(),
                grant.epoch,
                current.epoch,
                "report_serving",
            );
            stale.push(*grant);
        }
        Ok(stale)
    }
}

#[async_trait]
impl CallHandler for RegionHandler {
    async fn handle(&self, ctx: CallContext, request: Request) -> Result<Reply, RemoteError> {
        match request {
            Request::Ping { sent_at } => Ok(Reply::Pong { sent_at }),

            Request::ReportServing { grants } => {
                let stale = self.stale_grants(&ctx, &grants).await?;
                if stale.is_empty() {
                    return Ok(Reply::Ack);
                }

                let Some(connection) = route(&self.session, ctx.peer.id).await else {
                    return Ok(Reply::Ack);
                };
                if connection.id() != ctx.connection {
                    return Ok(Reply::Ack);
                }

                let deadline = self.stop_timeout;
                tokio::spawn(async move {
                    for grant in stale {
                        let request = Request::StopServing {
                            segment: grant.segment,
                            service: grant.service,
                            epoch: grant.epoch,
                        };
                        if let Err(e) = connection.call(request, deadline).await {
                            debug!(
                                segment_id = %grant.segment,
                                service = %grant.service,
                                error = %e,
                                "StopServing for stale grant failed"
                            );
                        }
                    }
                });
                Ok(Reply::Ack)
            }

            other => Err(RemoteError::unsupported(other)),
        }
    }
}
