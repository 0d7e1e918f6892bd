//! Run / pause / close control for stations
//!
//! `stopped -> running <-> paused -> closing -> stopped`
//!
//! Closing a stopped station keeps it from starting; its next start resets
//! it to `stopped` without running.
//!
//! System stations (dispatcher, trace, plan) ignore every request. The poll
//! loop notices `closing` within one poll timeout and tears the station down.

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::events::{EventKind, StationEvent};
use crate::station::Fabric;
use crate::types::{StationState, StationType};

/// Lifecycle handle over the station directory
#[derive(Clone)]
pub struct StationControl {
    fabric: Fabric,
}

impl StationControl {
    pub fn new(fabric: Fabric) -> Self {
        Self { fabric }
    }

    pub fn state(&self, name: &str) -> Option<StationState> {
        self.fabric.directory.state(name)
    }

    fn is_system(&self, name: &str) -> bool {
        self.fabric
            .directory
            .config(name)
            .map(|c| c.station_type.is_system())
            .unwrap_or(true)
    }

    fn flip(
        &self,
        name: &str,
        kind: EventKind,
        decide: impl FnOnce(StationState) -> Option<StationState>,
    ) -> bool {
        if self.is_system(name) {
            return false;
        }
        match self.fabric.directory.transition(name, decide) {
            Some((from, to)) => {
                info!("Lifecycle: {} {} -> {}", name, from, to);
                self.fabric.events.emit(StationEvent::new(kind, name));
                true
            }
            None => false,
        }
    }

    /// `running -> paused`
    pub fn pause(&self, name: &str) -> bool {
        self.flip(name, EventKind::Pause, |s| {
            (s == StationState::Running).then_some(StationState::Paused)
        })
    }

    /// `paused -> running`
    pub fn resume(&self, name: &str) -> bool {
        self.flip(name, EventKind::Resume, |s| {
            (s == StationState::Paused).then_some(StationState::Running)
        })
    }

    /// `running | paused | stopped -> closing`, optionally waiting until a
    /// running station is down
    pub async fn close(&self, name: &str, wait: bool) -> bool {
        let mut was_stopped = false;
        let flipped = self.flip(name, EventKind::Closing, |s| {
            was_stopped = s == StationState::Stopped;
            matches!(
                s,
                StationState::Running | StationState::Paused | StationState::Stopped
            )
            .then_some(StationState::Closing)
        });
        if !flipped || !wait || was_stopped {
            return flipped;
        }

        let global = &self.fabric.global;
        let deadline = Instant::now() + global.close_timeout();
        while self.state(name) == Some(StationState::Closing) {
            if Instant::now() >= deadline {
                warn!(
                    "Lifecycle: {} still closing after {:?}",
                    name,
                    global.close_timeout()
                );
                break;
            }
            sleep(global.close_poll_interval()).await;
        }
        true
    }

    /// Names of stations that accept lifecycle requests
    pub fn controllable(&self) -> Vec<String> {
        self.fabric
            .directory
            .names()
            .into_iter()
            .filter(|n| {
                self.fabric
                    .directory
                    .config(n)
                    .map(|c| !StationType::is_system(c.station_type))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, StationConfig};

    fn fabric() -> Fabric {
        let fabric = Fabric::in_memory(GlobalConfig::default());
        fabric.register(StationConfig::new("api", StationType::Api, 7000));
        fabric.register(StationConfig::new("plan", StationType::Plan, 7010));
        fabric
    }

    #[test]
    fn test_pause_resume() {
        let fabric = fabric();
        let control = StationControl::new(fabric.clone());
        assert!(!control.pause("api"));

        fabric.directory.set_state("api", StationState::Running);
        let mut events = fabric.events.subscribe();
        assert!(control.pause("api"));
        assert_eq!(control.state("api"), Some(StationState::Paused));
        assert!(!control.pause("api"));
        assert!(control.resume("api"));
        assert_eq!(control.state("api"), Some(StationState::Running));

        assert_eq!(events.try_recv().unwrap().kind, EventKind::Pause);
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Resume);
    }

    #[test]
    fn test_pause_on_closing_is_refused() {
        let fabric = fabric();
        let control = StationControl::new(fabric.clone());
        fabric.directory.set_state("api", StationState::Closing);
        assert!(!control.pause("api"));
        assert_eq!(control.state("api"), Some(StationState::Closing));
    }

    #[tokio::test]
    async fn test_close_stopped_station() {
        let fabric = fabric();
        let control = StationControl::new(fabric.clone());
        assert_eq!(control.state("api"), Some(StationState::Stopped));

        // no wait: nothing is polling a stopped station
        assert!(control.close("api", true).await);
        assert_eq!(control.state("api"), Some(StationState::Closing));
        assert!(!control.close("api", false).await);
    }

    #[tokio::test]
    async fn test_system_stations_ignore_control() {
        let fabric = fabric();
        let control = StationControl::new(fabric.clone());
        fabric.directory.set_state("plan", StationState::Running);
        assert!(!control.pause("plan"));
        assert!(!control.close("plan", false).await);
        assert_eq!(control.state("plan"), Some(StationState::Running));
        assert_eq!(control.controllable(), vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn test_close_wait_is_bounded() {
        let global = GlobalConfig {
            close_timeout_ms: 30,
            close_poll_interval_ms: 5,
            ..GlobalConfig::default()
        };
        let fabric = Fabric::in_memory(global);
        fabric.register(StationConfig::new("api", StationType::Api, 7000));
        fabric.directory.set_state("api", StationState::Running);

        let control = StationControl::new(fabric);
        assert!(control.close("api", true).await);
        // nobody polls, so the station stays in closing
        assert_eq!(control.state("api"), Some(StationState::Closing));
        assert!(!control.close("api", false).await);
    }
}
