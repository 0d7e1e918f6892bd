//! Core types shared by every station

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of a station (also its in-process endpoint name)
pub type StationName = String;

/// Process-wide job identifier
pub type GlobalId = u64;

/// Role a station plays in the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationType {
    Dispatcher,
    Queue,
    Trace,
    Notify,
    Api,
    Vote,
    Plan,
    RouteApi,
}

impl StationType {
    /// Infrastructure stations cannot be paused or closed from outside
    pub fn is_system(self) -> bool {
        matches!(
            self,
            StationType::Dispatcher | StationType::Trace | StationType::Plan
        )
    }

    /// Stations that talk to the plan, proxy and trace dispatchers
    pub fn is_general(self) -> bool {
        matches!(
            self,
            StationType::Api
                | StationType::RouteApi
                | StationType::Vote
                | StationType::Notify
                | StationType::Queue
        )
    }

    /// Stations that publish to subscribed workers
    pub fn is_publisher(self) -> bool {
        matches!(self, StationType::Notify | StationType::Queue)
    }

    /// Stations with routed worker in/out sockets
    pub fn is_api(self) -> bool {
        matches!(
            self,
            StationType::Api | StationType::RouteApi | StationType::Vote
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StationType::Dispatcher => "dispatcher",
            StationType::Queue => "queue",
            StationType::Trace => "trace",
            StationType::Notify => "notify",
            StationType::Api => "api",
            StationType::Vote => "vote",
            StationType::Plan => "plan",
            StationType::RouteApi => "route_api",
        }
    }
}

impl fmt::Display for StationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a station
///
/// `Stopped -> Running <-> Paused -> Closing -> Stopped`; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationState {
    #[default]
    Stopped,
    Running,
    Paused,
    Closing,
    Failed,
}

impl StationState {
    /// Whether a poll loop in this state keeps going
    pub fn can_poll(self) -> bool {
        matches!(self, StationState::Running | StationState::Paused)
    }
}

impl fmt::Display for StationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StationState::Stopped => "stopped",
            StationState::Running => "running",
            StationState::Paused => "paused",
            StationState::Closing => "closing",
            StationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status words sent back to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    FrameInvalid,
    DenyError,
    SendError,
    RecvError,
    Error,
    Pause,
    NotWorker,
    Welcome,
    Bye,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::FrameInvalid => "frame_invalid",
            Status::DenyError => "deny_error",
            Status::SendError => "send_error",
            Status::RecvError => "recv_error",
            Status::Error => "error",
            Status::Pause => "pause",
            Status::NotWorker => "not_worker",
            Status::Welcome => "welcome",
            Status::Bye => "bye",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "ok" => Status::Ok,
            "frame_invalid" => Status::FrameInvalid,
            "deny_error" => Status::DenyError,
            "send_error" => Status::SendError,
            "recv_error" => Status::RecvError,
            "error" => Status::Error,
            "pause" => Status::Pause,
            "not_worker" => Status::NotWorker,
            "welcome" => Status::Welcome,
            "bye" => Status::Bye,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic, process-wide source of job ids
///
/// Seeded from the wall clock so ids keep increasing across process restarts.
#[derive(Debug)]
pub struct GlobalIdSource {
    next: AtomicU64,
}

impl GlobalIdSource {
    pub fn new() -> Self {
        Self::starting_at(unix_millis() << 12)
    }

    pub fn starting_at(first: GlobalId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> GlobalId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for GlobalIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire form of a global id
pub fn format_global_id(id: GlobalId) -> String {
    format!("{:x}", id)
}

/// Parse the wire form of a global id
pub fn parse_global_id(raw: &[u8]) -> Option<GlobalId> {
    let s = std::str::from_utf8(raw).ok()?;
    GlobalId::from_str_radix(s, 16).ok()
}

/// Current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
