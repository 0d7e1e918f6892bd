//! Configuration for stations and the fabric they run in
//!
//! Loaded from JSON. Durations are plain millisecond counts so a config file
//! stays readable; accessors hand out [`Duration`]s.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::supervisor::RestartPolicy;
use crate::types::{StationName, StationState, StationType};

/// Traffic counters kept per station
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub request_in: u64,
    pub request_out: u64,
    pub request_err: u64,
    pub worker_in: u64,
    pub worker_out: u64,
    pub worker_err: u64,
}

/// TCP ports of a station; 0 means unused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationPorts {
    pub request: u16,
    pub worker_in: u16,
    pub worker_out: u16,
}

/// Per-station configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub station_name: StationName,
    pub station_type: StationType,
    #[serde(default)]
    pub ports: StationPorts,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub station_alias: Vec<String>,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub station_state: StationState,
    #[serde(flatten)]
    pub counters: Counters,
}

impl StationConfig {
    pub fn new(name: impl Into<String>, station_type: StationType, request_port: u16) -> Self {
        Self {
            station_name: name.into(),
            station_type,
            ports: StationPorts {
                request: request_port,
                ..Default::default()
            },
            description: String::new(),
            caption: String::new(),
            station_alias: Vec::new(),
            short_name: String::new(),
            station_state: StationState::Stopped,
            counters: Counters::default(),
        }
    }

    /// Set worker in/out ports
    pub fn with_worker_ports(mut self, worker_in: u16, worker_out: u16) -> Self {
        self.ports.worker_in = worker_in;
        self.ports.worker_out = worker_out;
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.station_alias.push(alias.into());
        self
    }
}

/// Which key family ballots are stored under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteNamespace {
    /// `vote:<station>:<token>`
    #[default]
    Station,
    /// `vote:<token>`
    Global,
}

/// Settings shared by every station in a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Shared secret trailing every external request
    pub service_key: String,

    /// Host used for binding TCP ports
    pub bind_host: String,

    /// Upper bound on one poll wait
    pub poll_timeout_ms: u64,

    /// Emit trace records to the trace dispatcher
    pub trace_net: bool,

    /// Treat traffic on WorkerOut as requests
    pub api_route_mode: bool,

    /// Wait for the plan dispatcher reply
    pub plan_timeout_ms: u64,

    /// Jobs older than this are abandoned
    pub job_timeout_ms: u64,

    /// Workers silent for longer than this are dropped
    pub worker_timeout_ms: u64,

    pub close_poll_interval_ms: u64,
    pub close_timeout_ms: u64,

    /// Expiry of a closed ballot
    pub ballot_ttl_secs: u64,

    pub vote_namespace: VoteNamespace,

    pub restart: RestartPolicy,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            service_key: "mesh".to_string(),
            bind_host: "0.0.0.0".to_string(),
            poll_timeout_ms: 500,
            trace_net: false,
            api_route_mode: false,
            plan_timeout_ms: 3_000,
            job_timeout_ms: 30_000,
            worker_timeout_ms: 15_000,
            close_poll_interval_ms: 50,
            close_timeout_ms: 5_000,
            ballot_ttl_secs: 3_600,
            vote_namespace: VoteNamespace::Station,
            restart: RestartPolicy::default(),
        }
    }
}

impl GlobalConfig {
    pub fn with_service_key(mut self, key: impl Into<String>) -> Self {
        self.service_key = key.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_trace_net(mut self, enabled: bool) -> Self {
        self.trace_net = enabled;
        self
    }

    pub fn with_api_route_mode(mut self, enabled: bool) -> Self {
        self.api_route_mode = enabled;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_vote_namespace(mut self, namespace: VoteNamespace) -> Self {
        self.vote_namespace = namespace;
        self
    }

    pub fn with_restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn plan_timeout(&self) -> Duration {
        Duration::from_millis(self.plan_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn close_poll_interval(&self) -> Duration {
        Duration::from_millis(self.close_poll_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn ballot_ttl(&self) -> Duration {
        Duration::from_secs(self.ballot_ttl_secs)
    }
}

/// Everything a node process needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl FabricConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: FabricConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn station(&self, name: &str) -> Result<&StationConfig, ConfigError> {
        self.stations
            .iter()
            .find(|s| s.station_name == name)
            .ok_or_else(|| ConfigError::UnknownStation(name.to_string()))
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.station_name.as_str()) {
                return Err(ConfigError::DuplicateStation(station.station_name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "global": { "service_key": "k1", "trace_net": true, "poll_timeout_ms": 20 },
        "stations": [
            { "station_name": "vote", "station_type": "vote",
              "ports": { "request": 7100, "worker_in": 7101, "worker_out": 7102 },
              "caption": "Voting", "request_err": 4 },
            { "station_name": "plan_dispatcher", "station_type": "dispatcher" }
        ]
    }"#;

    #[test]
    fn test_parse_fabric_config() {
        let config = FabricConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.global.service_key, "k1");
        assert!(config.global.trace_net);
        assert_eq!(config.global.poll_timeout(), Duration::from_millis(20));
        assert_eq!(config.global.ballot_ttl(), Duration::from_secs(3600));

        let vote = config.station("vote").unwrap();
        assert_eq!(vote.station_type, StationType::Vote);
        assert_eq!(vote.ports.worker_out, 7102);
        assert_eq!(vote.counters.request_err, 4);
        assert_eq!(vote.station_state, StationState::Stopped);

        assert!(matches!(
            config.station("missing"),
            Err(ConfigError::UnknownStation(_))
        ));
    }

    #[test]
    fn test_duplicate_station_rejected() {
        let json = r#"{ "stations": [
            { "station_name": "a", "station_type": "api" },
            { "station_name": "a", "station_type": "queue" }
        ]}"#;
        assert!(matches!(
            FabricConfig::from_json(json),
            Err(ConfigError::DuplicateStation(name)) if name == "a"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = FabricConfig::load(file.path()).unwrap();
        assert_eq!(config.stations.len(), 2);
    }

    #[test]
    fn test_global_builder() {
        let global = GlobalConfig::default()
            .with_service_key("s")
            .with_poll_timeout(Duration::from_millis(10))
            .with_vote_namespace(VoteNamespace::Global);
        assert_eq!(global.service_key, "s");
        assert_eq!(global.poll_timeout_ms, 10);
        assert_eq!(global.vote_namespace, VoteNamespace::Global);
    }

    #[test]
    fn test_station_builder() {
        let station = StationConfig::new("api", StationType::Api, 7000)
            .with_worker_ports(7001, 7002)
            .with_caption("Gateway")
            .with_alias("gw");
        assert_eq!(station.ports.request, 7000);
        assert_eq!(station.ports.worker_in, 7001);
        assert_eq!(station.station_alias, vec!["gw".to_string()]);
    }
}
