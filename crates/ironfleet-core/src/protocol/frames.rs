//! Wire frames exchanged between rack and region controllers.

use crate::error::RemoteError;
use crate::ids::{MachineId, SegmentId, StepId};
use crate::models::{
    ControllerIdentity, PowerAction, PowerState, PowerTarget, ScriptOutcome, ServiceKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One frame on a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Sent by the rack as the first frame.
    Hello(ControllerIdentity),
    /// Region's answer to an accepted `Hello`.
    Welcome(ControllerIdentity),
    /// Region's answer to a refused `Hello`; the connection closes after it.
    Rejected { reason: String },
    Request {
        seq: u64,
        /// Remaining budget the caller will wait for the response.
        deadline_ms: u64,
        body: Request,
    },
    Response {
        seq: u64,
        result: Result<Reply, RemoteError>,
    },
    /// Unsolicited notification, no response expected.
    Event { event: Event },
    /// Sender stops issuing calls and will close once in-flight work is done.
    Drain,
    /// Final frame before the sender closes the transport.
    Goodbye,
}

/// Calls in either direction. Each side rejects the ones it does not serve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping {
        sent_at: DateTime<Utc>,
    },
    QueryPower {
        target: PowerTarget,
    },
    SetPower {
        target: PowerTarget,
        action: PowerAction,
    },
    RunScripts {
        target: PowerTarget,
        script_set: String,
        step: StepId,
    },
    ScriptStatus {
        machine: MachineId,
        step: StepId,
    },
    StartServing {
        segment: SegmentId,
        service: ServiceKind,
        epoch: u64,
    },
    StopServing {
        segment: SegmentId,
        service: ServiceKind,
        epoch: u64,
    },
    /// Rack→region: the grants the rack is currently acting on.
    ReportServing {
        grants: Vec<ServingGrant>,
    },
}

impl Request {
    /// Short operation name for logs and metrics labels.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::QueryPower { .. } => "query_power",
            Request::SetPower { .. } => "set_power",
            Request::RunScripts { .. } => "run_scripts",
            Request::ScriptStatus { .. } => "script_status",
            Request::StartServing { .. } => "start_serving",
            Request::StopServing { .. } => "stop_serving",
            Request::ReportServing { .. } => "report_serving",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Pong { sent_at: DateTime<Utc> },
    Ack,
    Power { state: PowerState },
    Scripts { outcome: ScriptOutcome },
    ScriptStatus { status: ScriptStatus },
    /// Answer to `StartServing`. `accepted` is false when the rack already
    /// acts on a newer epoch for the pair.
    Serving { epoch: u64, accepted: bool },
}

/// State of a script run the rack knows about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    Running,
    Completed(ScriptOutcome),
    Unknown,
}

/// One (segment, service) grant held by a rack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServingGrant {
    pub segment: SegmentId,
    pub service: ServiceKind,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PowerStateChanged {
        machine: MachineId,
        state: PowerState,
        observed_at: DateTime<Utc>,
    },
    /// Rack stopped serving on its own, e.g. after losing the granting region.
    ServiceStopped {
        grant: ServingGrant,
        reason: String,
    },
}
