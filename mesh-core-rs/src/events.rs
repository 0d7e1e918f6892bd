//! Lifecycle and presence events
//!
//! Stations and the lifecycle controller publish [`StationEvent`]s on an
//! [`EventBus`]. Nobody has to listen; events sent without subscribers are
//! dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::StationName;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Join,
    Pause,
    Resume,
    Closing,
    Left,
    Failed,
    WorkerJoin,
    WorkerLeft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEvent {
    pub kind: EventKind,
    pub station: StationName,
    pub at: DateTime<Utc>,
    /// Worker flow name or failure reason
    pub detail: Option<String>,
}

impl StationEvent {
    pub fn new(kind: EventKind, station: impl Into<String>) -> Self {
        Self {
            kind,
            station: station.into(),
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Broadcast channel for station events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StationEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
