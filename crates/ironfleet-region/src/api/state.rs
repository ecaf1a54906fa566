//! Application State
//!
//! Shared state passed to all API handlers.

use crate::election::ElectionCoordinator;
use crate::lifecycle::LifecycleEngine;
use crate::observability::MetricsState;
use crate::session::RegionSession;
use crate::store::Store;
use kameo::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub session: ActorRef<RegionSession>,
    pub election: ActorRef<ElectionCoordinator>,
    pub engine: LifecycleEngine,
    pub metrics_state: Option<MetricsState>,
    /// Set once stored machines are loaded and the rack listener is bound.
    pub readiness: Arc<AtomicBool>,
}
