//! Durable Records
//!
//! Machines, controllers and service assignments are stored as JSON values
//! under fixed key prefixes. The [`Backend`] is a revisioned key/value map
//! (etcd, or an in-memory map for tests and single-node runs); [`Store`]
//! layers the typed records on top of it.
//!
//! Assignments are only ever written with a compare-and-swap against the
//! revision that was read, so two electors can never both bump an epoch.

mod etcd;
mod memory;

pub use etcd::{EtcdBackend, EtcdOptions};
pub use memory::MemoryBackend;

use crate::lifecycle::MachineRecord;
use async_trait::async_trait;
use ironfleet_core::error::{Classify, ErrorClass};
use ironfleet_core::ids::{ControllerId, MachineId, SegmentId};
use ironfleet_core::models::{ControllerRecord, ServiceAssignment, ServiceKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub const MACHINES_PREFIX: &str = "/ironfleet/machines/";
pub const CONTROLLERS_PREFIX: &str = "/ironfleet/controllers/";
pub const ASSIGNMENTS_PREFIX: &str = "/ironfleet/assignments/";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("failed to decode {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Etcd(_) | StoreError::Unavailable(_) => ErrorClass::TransientTransport,
            StoreError::Decode { .. } | StoreError::Encode { .. } => {
                ErrorClass::CapabilityPermanent
            }
        }
    }
}

/// Raw value with the revision it was last modified at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: String,
    pub value: String,
    pub revision: i64,
}

/// A decoded record and its revision. Revision 0 means the key is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: i64,
}

/// Revisioned key/value storage.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<RawEntry>, StoreError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Write `value` only if the key is still at `expected_revision`
    /// (0: the key must not exist). Returns false when the comparison failed.
    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: String,
    ) -> Result<bool, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;
}

/// Typed access to region records.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn machine_key(id: &MachineId) -> String {
        format!("{MACHINES_PREFIX}{id}")
    }

    pub fn controller_key(id: &ControllerId) -> String {
        format!("{CONTROLLERS_PREFIX}{id}")
    }

    pub fn assignment_key(segment: &SegmentId, service: ServiceKind) -> String {
        format!("{ASSIGNMENTS_PREFIX}{segment}/{service}")
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        self.backend.health().await
    }

    pub async fn list_machines(&self) -> Result<Vec<MachineRecord>, StoreError> {
        self.list_decoded(MACHINES_PREFIX).await
    }

    pub async fn get_machine(&self, id: &MachineId) -> Result<Option<MachineRecord>, StoreError> {
        self.get_decoded(&Self::machine_key(id))
            .await
            .map(|v| v.map(|v| v.value))
    }

    pub async fn put_machine(&self, record: &MachineRecord) -> Result<(), StoreError> {
        let key = Self::machine_key(&record.id);
        let value = encode(&key, record)?;
        self.backend.put(&key, value).await
    }

    pub async fn list_controllers(&self) -> Result<Vec<ControllerRecord>, StoreError> {
        self.list_decoded(CONTROLLERS_PREFIX).await
    }

    pub async fn get_controller(
        &self,
        id: &ControllerId,
    ) -> Result<Option<ControllerRecord>, StoreError> {
        self.get_decoded(&Self::controller_key(id))
            .await
            .map(|v| v.map(|v| v.value))
    }

    pub async fn put_controller(&self, record: &ControllerRecord) -> Result<(), StoreError> {
        let key = Self::controller_key(&record.id);
        let value = encode(&key, record)?;
        self.backend.put(&key, value).await
    }

    /// Current assignment for a pair; vacant at revision 0 if never elected.
    pub async fn load_assignment(
        &self,
        segment: SegmentId,
        service: ServiceKind,
    ) -> Result<Versioned<ServiceAssignment>, StoreError> {
        let key = Self::assignment_key(&segment, service);
        Ok(self
            .get_decoded(&key)
            .await?
            .unwrap_or_else(|| Versioned {
                value: ServiceAssignment::vacant(segment, service),
                revision: 0,
            }))
    }

    pub async fn list_assignments(&self) -> Result<Vec<ServiceAssignment>, StoreError> {
        let mut assignments: Vec<ServiceAssignment> =
            self.list_decoded(ASSIGNMENTS_PREFIX).await?;
        assignments.sort_by(|a, b| (a.segment, a.service).cmp(&(b.segment, b.service)));
        Ok(assignments)
    }

    /// Compare-and-swap an assignment against the revision it was loaded at.
    pub async fn swap_assignment(
        &self,
        expected_revision: i64,
        next: &ServiceAssignment,
    ) -> Result<bool, StoreError> {
        let key = Self::assignment_key(&next.segment, next.service);
        let value = encode(&key, next)?;
        self.backend
            .compare_and_put(&key, expected_revision, value)
            .await
    }

    async fn get_decoded<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        match self.backend.get(key).await? {
            Some(entry) => Ok(Some(Versioned {
                value: decode(&entry)?,
                revision: entry.revision,
            })),
            None => Ok(None),
        }
    }

    async fn list_decoded<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.backend
            .list(prefix)
            .await?
            .iter()
            .map(decode)
            .collect()
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(entry: &RawEntry) -> Result<T, StoreError> {
    serde_json::from_str(&entry.value).map_err(|source| StoreError::Decode {
        key: entry.key.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleState, MachineRegistration};
    use ironfleet_core::models::{ControllerKind, PowerConfig};

    fn machine() -> MachineRecord {
        MachineRecord::new(MachineRegistration {
            id: MachineId::new(),
            hostname: "node-01".to_string(),
            segment: SegmentId::new(),
            rack_of_record: None,
            power: PowerConfig {
                driver: "ipmi".to_string(),
                address: "10.0.0.10".to_string(),
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn test_machine_round_trip() {
        let store = Store::in_memory();
        let mut record = machine();
        store.put_machine(&record).await.unwrap();

        record.state = LifecycleState::Ready;
        store.put_machine(&record).await.unwrap();

        let loaded = store.get_machine(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, LifecycleState::Ready);
        assert_eq!(store.list_machines().await.unwrap().len(), 1);
        assert!(store.get_machine(&MachineId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_assignment_is_vacant() {
        let store = Store::in_memory();
        let segment = SegmentId::new();
        let loaded = store.load_assignment(segment, ServiceKind::Boot).await.unwrap();
        assert_eq!(loaded.revision, 0);
        assert_eq!(loaded.value, ServiceAssignment::vacant(segment, ServiceKind::Boot));
        assert!(store.list_assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_swap_assignment_rejects_stale_revision() {
        let store = Store::in_memory();
        let segment = SegmentId::new();
        let vacant = store.load_assignment(segment, ServiceKind::Boot).await.unwrap();

        let mut first = vacant.value.clone();
        first.owner = Some(ControllerId::new());
        first.epoch = 1;
        assert!(store.swap_assignment(vacant.revision, &first).await.unwrap());

        // A second writer that read the vacant record loses.
        let mut second = vacant.value.clone();
        second.owner = Some(ControllerId::new());
        second.epoch = 1;
        assert!(!store.swap_assignment(vacant.revision, &second).await.unwrap());

        let current = store.load_assignment(segment, ServiceKind::Boot).await.unwrap();
        assert_eq!(current.value, first);
        assert!(current.revision > 0);
    }

    #[tokio::test]
    async fn test_controllers() {
        let store = Store::in_memory();
        let record = ControllerRecord::new(ControllerId::new(), ControllerKind::Rack, "rack-a");
        store.put_controller(&record).await.unwrap();
        assert_eq!(
            store.get_controller(&record.id).await.unwrap(),
            Some(record.clone())
        );
        assert_eq!(store.list_controllers().await.unwrap(), vec![record]);
    }

    #[test]
    fn test_store_errors_classify() {
        let err = StoreError::Unavailable("down".into());
        assert_eq!(err.class(), ErrorClass::TransientTransport);
    }
}
