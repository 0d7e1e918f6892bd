//! Station supervision with a restart policy
//!
//! Each attempt builds a fresh [`Station`] (fresh sockets) in its own task.
//! A closed station stays down, an initialization failure is terminal, and a
//! failed poll loop is restarted with exponential backoff until the policy
//! runs out.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::StationError;
use crate::events::EventKind;
use crate::events::StationEvent;
use crate::station::{Fabric, PollExit, Station};
use crate::types::StationState;

/// How often and how fast a failed station is restarted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    /// Exponential backoff cap
    pub max_backoff_ms: u64,
    /// Random extra delay as a fraction of the backoff
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            jitter: 0.25,
        }
    }
}

impl RestartPolicy {
    /// Never restart
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn allows(&self, restarts: u32) -> bool {
        restarts < self.max_restarts
    }

    /// Delay before restart number `attempt` (1-based), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Delay before restart number `attempt`, jitter included
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        base + Duration::from_millis(extra as u64)
    }
}

/// How supervision ended
#[derive(Debug)]
pub enum SupervisorExit {
    /// Closed on request
    Closed,
    /// Could not start; no restart attempted
    InitFailed(StationError),
    /// Kept failing until the policy ran out
    Exhausted { restarts: u32, reason: String },
}

/// Keeps one station alive
pub struct Supervisor {
    name: String,
    fabric: Fabric,
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, fabric: Fabric) -> Self {
        let policy = fabric.global.restart.clone();
        Self {
            name: name.into(),
            fabric,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn spawn(self) -> JoinHandle<SupervisorExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> SupervisorExit {
        let mut restarts = 0u32;
        loop {
            let station = match Station::new(&self.name, self.fabric.clone()) {
                Ok(station) => station,
                Err(e) => {
                    error!("Supervisor: cannot build {}: {}", self.name, e);
                    return SupervisorExit::InitFailed(e);
                }
            };

            let reason = match tokio::spawn(station.run()).await {
                Ok(Ok(PollExit::Closed)) => {
                    info!("Supervisor: {} closed", self.name);
                    return SupervisorExit::Closed;
                }
                Ok(Ok(PollExit::Failed(reason))) => reason,
                Ok(Err(e)) => {
                    error!("Supervisor: {} failed to start: {}", self.name, e);
                    return SupervisorExit::InitFailed(e);
                }
                Err(join) => {
                    self.fabric
                        .directory
                        .set_state(&self.name, StationState::Stopped);
                    format!("station task aborted: {}", join)
                }
            };

            if !self.policy.allows(restarts) {
                error!(
                    "Supervisor: {} gave up after {} restarts: {}",
                    self.name, restarts, reason
                );
                self.fabric
                    .directory
                    .set_state(&self.name, StationState::Failed);
                self.fabric.events.emit(
                    StationEvent::new(EventKind::Failed, self.name.clone()).with_detail(reason.clone()),
                );
                return SupervisorExit::Exhausted { restarts, reason };
            }

            restarts += 1;
            let delay = self.policy.backoff(restarts);
            warn!(
                "Supervisor: {} failed ({}), restart {} of {} in {:?}",
                self.name, reason, restarts, self.policy.max_restarts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
