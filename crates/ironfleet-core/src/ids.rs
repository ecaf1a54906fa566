//! Typed identifiers
//!
//! Every record in the control plane is keyed by a UUID. Wrapping each kind of
//! UUID in its own newtype keeps a machine id from being passed where a
//! controller id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $short:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Last eight hex digits, for log lines.
            pub fn short(&self) -> String {
                let simple = self.0.simple().to_string();
                format!("{}-{}", $short, &simple[24..])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

typed_id!(
    /// Identity of a region or rack controller process.
    ControllerId,
    "ctl"
);
typed_id!(
    /// Identity of a managed physical machine.
    MachineId,
    "mach"
);
typed_id!(
    /// Identity of a managed network segment (a VLAN/subnet served by racks).
    SegmentId,
    "seg"
);
typed_id!(
    /// Identity of one in-flight lifecycle step.
    StepId,
    "step"
);
typed_id!(
    /// Identity of one accepted lifecycle command and its history record.
    TransitionId,
    "tr"
);
typed_id!(
    /// Identity of one connection between a rack and a region process.
    ConnectionId,
    "conn"
);
