//! Data model shared by region and rack controllers
//!
//! Only the records that cross the wire or are needed on both sides live here.
//! The machine lifecycle record itself is owned by the region.

use crate::ids::{ControllerId, MachineId, SegmentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumIter, EnumString};

/// Which side of the control plane a controller process runs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControllerKind {
    Region,
    Rack,
}

/// Network services a rack controller can provide for a segment.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceKind {
    DhcpV4,
    DhcpV6,
    /// TFTP/HTTP boot. The owner of this service is also the rack that
    /// performs power and script operations for machines on the segment.
    Boot,
    Ntp,
}

/// Services a rack advertises for one segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCapability {
    pub segment: SegmentId,
    pub services: BTreeSet<ServiceKind>,
}

impl SegmentCapability {
    pub fn new(segment: SegmentId, services: impl IntoIterator<Item = ServiceKind>) -> Self {
        Self {
            segment,
            services: services.into_iter().collect(),
        }
    }

    /// Parse `"<segment-uuid>=dhcpv4+boot"`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (segment, services) = spec
            .split_once('=')
            .ok_or_else(|| format!("segment capability '{spec}' is missing '='"))?;
        let segment: SegmentId = segment
            .trim()
            .parse()
            .map_err(|e| format!("invalid segment id '{segment}': {e}"))?;
        let services = services
            .split('+')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<ServiceKind>()
                    .map_err(|_| format!("unknown service '{s}'"))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        if services.is_empty() {
            return Err(format!("segment {segment} advertises no services"));
        }
        Ok(Self { segment, services })
    }
}

/// Identity and capabilities announced by each side on connect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerIdentity {
    pub id: ControllerId,
    pub kind: ControllerKind,
    pub name: String,
    /// Process start time; distinguishes a restarted process from a reconnect.
    pub started_at: DateTime<Utc>,
    pub version: String,
    pub protocol: u32,
    #[serde(default)]
    pub segments: Vec<SegmentCapability>,
}

/// First time a rack advertised a segment. Drives the election tie-break, so
/// it is persisted and never moved forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRegistration {
    pub registered_at: DateTime<Utc>,
    pub services: BTreeSet<ServiceKind>,
}

/// Durable controller record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub id: ControllerId,
    pub kind: ControllerKind,
    pub name: String,
    /// Revoked controllers are refused at handshake time.
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub segments: BTreeMap<SegmentId, SegmentRegistration>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ControllerRecord {
    pub fn new(id: ControllerId, kind: ControllerKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            revoked: false,
            segments: BTreeMap::new(),
            last_seen: None,
        }
    }

    /// Merge advertised capabilities, keeping the original registration time of
    /// segments already known. Returns true when the record changed.
    pub fn merge_capabilities(&mut self, caps: &[SegmentCapability], now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for cap in caps {
            match self.segments.get_mut(&cap.segment) {
                Some(existing) => {
                    if existing.services != cap.services {
                        existing.services = cap.services.clone();
                        changed = true;
                    }
                }
                None => {
                    self.segments.insert(
                        cap.segment,
                        SegmentRegistration {
                            registered_at: now,
                            services: cap.services.clone(),
                        },
                    );
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Health of one connection.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionHealth {
    Connecting,
    Established,
    Draining,
    Closed,
}

/// Owner of one (segment, service) pair at one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssignment {
    pub segment: SegmentId,
    pub service: ServiceKind,
    pub owner: Option<ControllerId>,
    pub epoch: u64,
    /// Set once the owner acknowledged `StartServing` for this epoch.
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub elected_at: Option<DateTime<Utc>>,
}

impl ServiceAssignment {
    pub fn vacant(segment: SegmentId, service: ServiceKind) -> Self {
        Self {
            segment,
            service,
            owner: None,
            epoch: 0,
            confirmed: false,
            elected_at: None,
        }
    }
}

/// Observed power state of a machine.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

/// Power verb sent to a driver.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
}

impl PowerAction {
    /// Power state the machine is expected to be in once the action completes.
    pub fn resulting_state(&self) -> PowerState {
        match self {
            PowerAction::On | PowerAction::Cycle => PowerState::On,
            PowerAction::Off => PowerState::Off,
        }
    }
}

/// BMC parameters for a machine. Vendor specifics stay opaque to the core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Driver name understood by the rack's power driver (e.g. "ipmi", "redfish").
    pub driver: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Everything a rack needs to act on a machine's BMC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerTarget {
    pub machine: MachineId,
    pub power: PowerConfig,
}

/// Result of running a script set against a machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub passed: bool,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Hardware facts discovered by the scripts (commissioning).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
}
