//! Station directory and worker registries
//!
//! The [`Directory`] owns one record per station name: its configuration and
//! the registry of workers attached to it. Stations only keep their name and
//! go through the directory for every read or update. All access runs under a
//! single mutex that is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ballot::is_reserved_field;
use crate::config::{Counters, StationConfig};
use crate::types::{StationName, StationState};

/// Presence state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Joined,
    Ready,
}

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub flow_name: String,
    pub state: WorkerState,
    pub last_seen: Instant,
}

/// Why a join was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRefused {
    ReservedName,
    EmptyName,
}

/// Workers attached to one station, keyed by routing address
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<Bytes, WorkerEntry>,
    cursor: usize,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh an entry; returns whether the address was new
    pub fn join(&mut self, address: Bytes, flow_name: &str) -> Result<bool, JoinRefused> {
        if flow_name.is_empty() {
            return Err(JoinRefused::EmptyName);
        }
        if is_reserved_field(flow_name) {
            return Err(JoinRefused::ReservedName);
        }
        let now = Instant::now();
        let fresh = match self.workers.get_mut(&address) {
            Some(entry) => {
                entry.flow_name = flow_name.to_string();
                entry.state = WorkerState::Joined;
                entry.last_seen = now;
                false
            }
            None => {
                self.workers.insert(
                    address,
                    WorkerEntry {
                        flow_name: flow_name.to_string(),
                        state: WorkerState::Joined,
                        last_seen: now,
                    },
                );
                true
            }
        };
        Ok(fresh)
    }

    pub fn mark_ready(&mut self, address: &Bytes) -> bool {
        match self.workers.get_mut(address) {
            Some(entry) => {
                entry.state = WorkerState::Ready;
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refresh last-seen
    pub fn touch(&mut self, address: &Bytes) -> bool {
        match self.workers.get_mut(address) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn leave(&mut self, address: &Bytes) -> Option<WorkerEntry> {
        self.workers.remove(address)
    }

    pub fn get(&self, address: &Bytes) -> Option<&WorkerEntry> {
        self.workers.get(address)
    }

    pub fn address_of(&self, flow_name: &str) -> Option<Bytes> {
        self.workers
            .iter()
            .find(|(_, w)| w.flow_name == flow_name)
            .map(|(addr, _)| addr.clone())
    }

    /// Next ready worker, round robin
    pub fn next_ready(&mut self) -> Option<Bytes> {
        let ready: Vec<&Bytes> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Ready)
            .map(|(addr, _)| addr)
            .collect();
        if ready.is_empty() {
            return None;
        }
        let pick = ready[self.cursor % ready.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Some(pick)
    }

    /// Every registered worker as `(address, flow name)`
    pub fn participants(&self) -> Vec<(Bytes, String)> {
        self.workers
            .iter()
            .map(|(addr, w)| (addr.clone(), w.flow_name.clone()))
            .collect()
    }

    /// Remove workers not seen within `timeout`
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<(Bytes, WorkerEntry)> {
        let stale: Vec<Bytes> = self
            .workers
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_seen) > timeout)
            .map(|(addr, _)| addr.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|addr| self.workers.remove(&addr).map(|w| (addr, w)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Which counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RequestIn,
    RequestOut,
    RequestErr,
    WorkerIn,
    WorkerOut,
    WorkerErr,
}

impl Counters {
    fn slot(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::RequestIn => &mut self.request_in,
            Counter::RequestOut => &mut self.request_out,
            Counter::RequestErr => &mut self.request_err,
            Counter::WorkerIn => &mut self.worker_in,
            Counter::WorkerOut => &mut self.worker_out,
            Counter::WorkerErr => &mut self.worker_err,
        }
    }
}

#[derive(Debug)]
pub struct StationRecord {
    pub config: StationConfig,
    pub workers: WorkerRegistry,
}

/// Process-wide station directory
#[derive(Debug, Default)]
pub struct Directory {
    records: Mutex<HashMap<StationName, StationRecord>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; an existing record with the same name is kept
    pub fn register(&self, config: StationConfig) -> bool {
        let mut records = self.records.lock();
        if records.contains_key(&config.station_name) {
            return false;
        }
        records.insert(
            config.station_name.clone(),
            StationRecord {
                config,
                workers: WorkerRegistry::new(),
            },
        );
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<StationName> {
        let mut names: Vec<_> = self.records.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn with_record<R>(&self, name: &str, f: impl FnOnce(&mut StationRecord) -> R) -> Option<R> {
        self.records.lock().get_mut(name).map(f)
    }

    pub fn with_workers<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut WorkerRegistry) -> R,
    ) -> Option<R> {
        self.with_record(name, |r| f(&mut r.workers))
    }

    pub fn config(&self, name: &str) -> Option<StationConfig> {
        self.with_record(name, |r| r.config.clone())
    }

    pub fn state(&self, name: &str) -> Option<StationState> {
        self.with_record(name, |r| r.config.station_state)
    }

    pub fn set_state(&self, name: &str, state: StationState) -> bool {
        self.with_record(name, |r| r.config.station_state = state)
            .is_some()
    }

    /// Atomically move to the state `decide` picks for the current one
    ///
    /// Returns `(from, to)` when a transition happened.
    pub fn transition(
        &self,
        name: &str,
        decide: impl FnOnce(StationState) -> Option<StationState>,
    ) -> Option<(StationState, StationState)> {
        self.with_record(name, |r| {
            let from = r.config.station_state;
            let to = decide(from)?;
            r.config.station_state = to;
            Some((from, to))
        })
        .flatten()
    }

    pub fn counters(&self, name: &str) -> Option<Counters> {
        self.with_record(name, |r| r.config.counters)
    }

    pub fn bump(&self, name: &str, counter: Counter) {
        self.with_record(name, |r| {
            let slot = r.config.counters.slot(counter);
            *slot = slot.saturating_add(1);
        });
    }

    pub fn unbump(&self, name: &str, counter: Counter) {
        self.with_record(name, |r| {
            let slot = r.config.counters.slot(counter);
            *slot = slot.saturating_sub(1);
        });
    }
}
