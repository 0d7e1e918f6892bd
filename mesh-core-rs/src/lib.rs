//! Mesh Core Library
//!
//! Station engine for a message-routing fabric: multi-frame wire protocol,
//! router/dealer style transport, API/publish/vote stations, worker
//! heartbeats, lifecycle control and supervised restarts.

pub mod types;
pub mod error;
pub mod frame;
pub mod transport;
pub mod config;
pub mod registry;
pub mod events;
pub mod store;
pub mod ballot;
pub mod station;
pub mod lifecycle;
pub mod supervisor;

pub use types::*;
pub use error::{ConfigError, FrameError, StationError, StoreError, TransportError};
pub use config::{FabricConfig, GlobalConfig, StationConfig};
pub use frame::{Command, Description, Envelope, FrameType};
pub use station::{Fabric, Station};
pub use lifecycle::StationControl;
pub use supervisor::{RestartPolicy, Supervisor, SupervisorExit};
