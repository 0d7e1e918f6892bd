//! Station engine
//!
//! A [`Station`] owns a role-tagged socket table and runs one poll loop:
//!
//! - request sockets feed the [`router`]
//! - `WorkerIn` feeds the [`collector`]
//! - `WorkerOut` feeds the router in API-route mode (vote stations
//!   excepted), otherwise the handler's worker-out hook
//!
//! Station types differ only in their [`StationHandler`]. Shared state
//! (directory, id source, sockets, store) lives in the [`Fabric`].

pub mod api;
pub mod collector;
pub mod heartbeat;
pub mod jobs;
pub mod router;
pub mod vote;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::select_all;
use tracing::{debug, error, info, warn};

use crate::config::{GlobalConfig, StationConfig};
use crate::error::{Severity, StationError, TransportError};
use crate::events::{EventBus, EventKind, StationEvent};
use crate::frame::{Envelope, FrameType, Origin, Tag, TracePoint};
use crate::registry::{Counter, Directory};
use crate::store::{MemoryStore, RecordStore};
use crate::transport::{Endpoint, FrameSocket, InprocHub, SocketFactory, SocketKind};
use crate::types::{GlobalIdSource, StationName, StationState, StationType, Status};

pub use jobs::{Job, JobKind, JobSource, JobTable};

/// In-process endpoint of the plan dispatcher
pub const PLAN_DISPATCHER: &str = "plan_dispatcher";
/// In-process endpoint of the proxy dispatcher
pub const PROXY_DISPATCHER: &str = "proxy_dispatcher";
/// In-process endpoint of the trace dispatcher
pub const TRACE_DISPATCHER: &str = "trace_dispatcher";

/// Role of a socket inside a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    RequestExternal,
    RequestLoopback,
    WorkerIn,
    WorkerOut,
    PlanDispatch,
    ProxyDispatch,
    TraceDispatch,
}

impl SocketRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketRole::RequestExternal => "request_external",
            SocketRole::RequestLoopback => "request_loopback",
            SocketRole::WorkerIn => "worker_in",
            SocketRole::WorkerOut => "worker_out",
            SocketRole::PlanDispatch => "plan_dispatch",
            SocketRole::ProxyDispatch => "proxy_dispatch",
            SocketRole::TraceDispatch => "trace_dispatch",
        }
    }

    /// Framing used by the peers on this socket
    pub fn origin(self) -> Origin {
        match self {
            SocketRole::RequestExternal | SocketRole::WorkerIn | SocketRole::WorkerOut => {
                Origin::External
            }
            SocketRole::RequestLoopback
            | SocketRole::PlanDispatch
            | SocketRole::ProxyDispatch
            | SocketRole::TraceDispatch => Origin::Loopback,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, SocketRole::RequestExternal | SocketRole::RequestLoopback)
    }

    pub fn is_worker(self) -> bool {
        matches!(self, SocketRole::WorkerIn | SocketRole::WorkerOut)
    }

    fn error_counter(self) -> Counter {
        if self.is_worker() {
            Counter::WorkerErr
        } else {
            Counter::RequestErr
        }
    }
}

/// Why a poll loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollExit {
    /// The station was asked to close
    Closed,
    /// A fatal transport error; the supervisor may restart
    Failed(String),
}

/// Shared context of every station in a process
#[derive(Clone)]
pub struct Fabric {
    pub directory: Arc<Directory>,
    pub ids: Arc<GlobalIdSource>,
    pub sockets: SocketFactory,
    pub global: Arc<GlobalConfig>,
    pub events: EventBus,
    pub store: Arc<dyn RecordStore>,
}

impl Fabric {
    /// Real TCP sockets, in-memory ballot store
    pub fn new(global: GlobalConfig) -> Self {
        Self::with_factory(global, SocketFactory::new(Arc::new(InprocHub::new())))
    }

    /// Every endpoint routed through one in-process hub
    pub fn in_memory(global: GlobalConfig) -> Self {
        Self::with_factory(global, SocketFactory::in_memory(Arc::new(InprocHub::new())))
    }

    fn with_factory(global: GlobalConfig, sockets: SocketFactory) -> Self {
        Self {
            directory: Arc::new(Directory::new()),
            ids: Arc::new(GlobalIdSource::new()),
            sockets,
            global: Arc::new(global),
            events: EventBus::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    /// Add a station record in the `stopped` state
    pub fn register(&self, mut config: StationConfig) -> bool {
        config.station_state = StationState::Stopped;
        self.directory.register(config)
    }

    /// Endpoint of a TCP port on this fabric's bind host
    pub fn tcp_endpoint(&self, port: u16) -> Endpoint {
        Endpoint::tcp(self.global.bind_host.clone(), port)
    }
}

/// Everything a handler may touch while serving one message
pub struct StationCore {
    pub name: StationName,
    pub station_type: StationType,
    pub fabric: Fabric,
    pub jobs: JobTable,
    sockets: Vec<(SocketRole, Box<dyn FrameSocket>)>,
    service_key: Bytes,
}

impl StationCore {
    fn new(name: StationName, station_type: StationType, fabric: Fabric) -> Self {
        let service_key = Bytes::copy_from_slice(fabric.global.service_key.as_bytes());
        Self {
            name,
            station_type,
            fabric,
            jobs: JobTable::new(),
            sockets: Vec::new(),
            service_key,
        }
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.fabric.global
    }

    pub fn service_key(&self) -> &Bytes {
        &self.service_key
    }

    pub fn state(&self) -> StationState {
        self.fabric
            .directory
            .state(&self.name)
            .unwrap_or(StationState::Stopped)
    }

    pub fn bump(&self, counter: Counter) {
        self.fabric.directory.bump(&self.name, counter);
    }

    pub fn unbump(&self, counter: Counter) {
        self.fabric.directory.unbump(&self.name, counter);
    }

    pub fn has_socket(&self, role: SocketRole) -> bool {
        self.sockets.iter().any(|(r, _)| *r == role)
    }

    fn socket_mut(&mut self, role: SocketRole) -> Result<&mut Box<dyn FrameSocket>, TransportError> {
        self.sockets
            .iter_mut()
            .find(|(r, _)| *r == role)
            .map(|(_, s)| s)
            .ok_or(TransportError::NoSocket(role.as_str()))
    }

    /// Send raw frames
    pub async fn send_raw(
        &mut self,
        role: SocketRole,
        frames: Vec<Bytes>,
    ) -> Result<(), TransportError> {
        self.socket_mut(role)?.send(frames).await
    }

    /// Encode for the socket's framing and send
    pub async fn send(&mut self, role: SocketRole, env: Envelope) -> Result<(), TransportError> {
        let key = self.service_key.clone();
        let socket = self.socket_mut(role)?;
        let frames = if socket.kind() == SocketKind::Router {
            env.encode(role.origin(), &key)
        } else {
            env.encode_unaddressed(role.origin(), &key)
        };
        socket.send(frames).await
    }

    /// Send a result to a requester, counting the outcome
    pub async fn reply(&mut self, role: SocketRole, env: Envelope) -> bool {
        let to = crate::transport::identity_label(env.address());
        match self.send(role, env).await {
            Ok(()) => {
                if role.is_request() {
                    self.bump(Counter::RequestOut);
                }
                true
            }
            Err(e) => {
                warn!("Station {}: reply to {} on {} failed: {}", self.name, to, role.as_str(), e);
                self.bump(role.error_counter());
                false
            }
        }
    }

    /// Reply with a bare status word
    pub async fn reply_status(&mut self, role: SocketRole, address: Bytes, status: Status) -> bool {
        let env = Envelope::status(role.origin(), address, status.as_str());
        self.reply(role, env).await
    }

    /// Receive with a deadline
    pub async fn recv_timeout(
        &mut self,
        role: SocketRole,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, TransportError> {
        let socket = self.socket_mut(role)?;
        tokio::time::timeout(timeout, socket.recv())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Discard anything already queued on `role`
    pub async fn drain(&mut self, role: SocketRole) -> usize {
        let mut dropped = 0;
        while self.recv_timeout(role, Duration::ZERO).await.is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Send a trace record of `env` to the trace dispatcher
    ///
    /// No-op unless `trace_net` is set. Failures are only logged.
    pub async fn trace(&mut self, env: &Envelope, point: TracePoint, status: Option<&str>) {
        if !self.fabric.global.trace_net || !self.has_socket(SocketRole::TraceDispatch) {
            return;
        }
        let mut record = env.clone();
        record.strip_service_key();
        record.append_frame(FrameType::StationId, Bytes::from(self.name.clone()));
        record.append_frame(
            FrameType::StationType,
            Bytes::from_static(self.station_type.as_str().as_bytes()),
        );
        if let Some(status) = status {
            record.append_frame(FrameType::Status, Bytes::copy_from_slice(status.as_bytes()));
        }
        record.description_mut().set_tag(Tag::Trace(point));
        if let Err(e) = self.send(SocketRole::TraceDispatch, record).await {
            debug!("Station {}: trace {:?} dropped: {}", self.name, point, e);
        }
    }

    pub fn emit(&self, kind: EventKind, detail: Option<String>) {
        let mut event = StationEvent::new(kind, self.name.clone());
        event.detail = detail;
        self.fabric.events.emit(event);
    }

    async fn close_sockets(&mut self) {
        while let Some((role, mut socket)) = self.sockets.pop() {
            socket.close().await;
            debug!("Station {}: closed {} socket", self.name, role.as_str());
        }
    }
}

/// Station-type behavior plugged into the engine
#[async_trait]
pub trait StationHandler: Send {
    /// A validated request got its global id
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        role: SocketRole,
        env: Envelope,
        kind: JobKind,
    );

    /// A worker result arrived on `WorkerIn`
    async fn job_end(&mut self, core: &mut StationCore, env: Envelope) {
        jobs::complete(core, env).await;
    }

    /// Command byte in the extension range
    async fn extension_command(&mut self, core: &mut StationCore, role: SocketRole, env: Envelope) {
        debug!(
            "Station {}: no handler for {:?}",
            core.name,
            env.description().command()
        );
        core.reply_status(role, env.address().clone(), Status::Error)
            .await;
    }

    /// Traffic on `WorkerOut` outside API-route mode
    async fn worker_out_message(&mut self, core: &mut StationCore, frames: Vec<Bytes>) {
        debug!(
            "Station {}: discarding {} frames from worker_out",
            core.name,
            frames.len()
        );
    }
}

/// Handler matching a station type
pub fn handler_for(station_type: StationType) -> Box<dyn StationHandler> {
    match station_type {
        StationType::Api | StationType::RouteApi => Box::new(api::ApiStation),
        StationType::Vote => Box::new(vote::VoteStation::new()),
        StationType::Notify | StationType::Queue => Box::new(api::PublishStation),
        StationType::Trace => Box::new(api::TraceSink::default()),
        StationType::Dispatcher | StationType::Plan => Box::new(api::DispatchStation),
    }
}

/// One running station
pub struct Station {
    core: StationCore,
    handler: Box<dyn StationHandler>,
    last_housekeeping: Instant,
}

impl Station {
    /// Station with the handler for its configured type
    pub fn new(name: &str, fabric: Fabric) -> Result<Self, StationError> {
        let config = fabric
            .directory
            .config(name)
            .ok_or_else(|| StationError::UnknownStation(name.to_string()))?;
        let handler = handler_for(config.station_type);
        Ok(Self::build(config, fabric, handler))
    }

    pub fn with_handler(
        name: &str,
        fabric: Fabric,
        handler: Box<dyn StationHandler>,
    ) -> Result<Self, StationError> {
        let config = fabric
            .directory
            .config(name)
            .ok_or_else(|| StationError::UnknownStation(name.to_string()))?;
        Ok(Self::build(config, fabric, handler))
    }

    fn build(config: StationConfig, fabric: Fabric, handler: Box<dyn StationHandler>) -> Self {
        Self {
            core: StationCore::new(config.station_name, config.station_type, fabric),
            handler,
            last_housekeeping: Instant::now(),
        }
    }

    pub fn core(&self) -> &StationCore {
        &self.core
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Build the socket table and move to `running`
    ///
    /// A station closed while stopped is reset to `stopped` and not started.
    pub async fn initialize(&mut self) -> Result<(), StationError> {
        let name = self.core.name.clone();
        let state = self.core.state();
        if state == StationState::Closing {
            self.core
                .fabric
                .directory
                .set_state(&name, StationState::Stopped);
            info!("Station {}: closed before start", name);
            return Err(StationError::ClosedBeforeStart(name));
        }
        if state != StationState::Stopped {
            return Err(StationError::NotStartable {
                station: name,
                state: state.to_string(),
            });
        }

        if let Err(e) = self.open_sockets().await {
            self.core.close_sockets().await;
            self.core
                .fabric
                .directory
                .set_state(&name, StationState::Failed);
            self.core.emit(EventKind::Failed, Some(e.to_string()));
            error!("Station {}: initialization failed: {}", name, e);
            return Err(e);
        }

        self.core
            .fabric
            .directory
            .set_state(&name, StationState::Running);
        self.core.emit(EventKind::Join, None);
        info!(
            "Station {}: running as {} with {} sockets",
            name,
            self.core.station_type,
            self.core.sockets.len()
        );
        Ok(())
    }

    async fn open_sockets(&mut self) -> Result<(), StationError> {
        let config = self
            .core
            .fabric
            .directory
            .config(&self.core.name)
            .ok_or_else(|| StationError::UnknownStation(self.core.name.clone()))?;
        let fabric = self.core.fabric.clone();
        let station_type = config.station_type;

        let external = fabric.tcp_endpoint(config.ports.request);
        self.bind(SocketRole::RequestExternal, SocketKind::Router, &external)
            .await?;
        let loopback = Endpoint::inproc(config.station_name.clone());
        self.bind(SocketRole::RequestLoopback, SocketKind::Router, &loopback)
            .await?;

        if station_type.is_general() {
            let identity = Bytes::from(config.station_name.clone());
            for (role, target) in [
                (SocketRole::PlanDispatch, PLAN_DISPATCHER),
                (SocketRole::ProxyDispatch, PROXY_DISPATCHER),
                (SocketRole::TraceDispatch, TRACE_DISPATCHER),
            ] {
                let socket = fabric
                    .sockets
                    .connect(SocketKind::Req, &Endpoint::inproc(target), Some(identity.clone()))
                    .await
                    .map_err(|source| StationError::Setup {
                        role: role.as_str(),
                        source,
                    })?;
                self.core.sockets.push((role, socket));
            }
        }

        if station_type.is_publisher() {
            let out = fabric.tcp_endpoint(config.ports.worker_out);
            self.bind(SocketRole::WorkerOut, SocketKind::Pub, &out).await?;
        }

        if station_type.is_api() {
            let out = fabric.tcp_endpoint(config.ports.worker_out);
            self.bind(SocketRole::WorkerOut, SocketKind::Router, &out)
                .await?;
            let inn = fabric.tcp_endpoint(config.ports.worker_in);
            self.bind(SocketRole::WorkerIn, SocketKind::Router, &inn)
                .await?;
        }
        Ok(())
    }

    async fn bind(
        &mut self,
        role: SocketRole,
        kind: SocketKind,
        endpoint: &Endpoint,
    ) -> Result<(), StationError> {
        let socket = self
            .core
            .fabric
            .sockets
            .bind(kind, endpoint)
            .await
            .map_err(|source| StationError::Setup {
                role: role.as_str(),
                source,
            })?;
        debug!(
            "Station {}: {} bound on {}",
            self.core.name,
            role.as_str(),
            endpoint
        );
        self.core.sockets.push((role, socket));
        Ok(())
    }

    fn is_polled(role: SocketRole, kind: SocketKind) -> bool {
        match role {
            SocketRole::RequestExternal | SocketRole::RequestLoopback | SocketRole::WorkerIn => true,
            SocketRole::WorkerOut => kind == SocketKind::Router,
            _ => false,
        }
    }

    /// Run until the station is closed or a fatal error occurs
    pub async fn poll(&mut self) -> PollExit {
        let timeout = self.core.global().poll_timeout();
        loop {
            if !self.core.state().can_poll() {
                info!("Station {}: leaving poll loop", self.core.name);
                return PollExit::Closed;
            }

            let polled: Vec<bool> = self
                .core
                .sockets
                .iter()
                .map(|(role, s)| Self::is_polled(*role, s.kind()))
                .collect();

            let ready = {
                let waits: Vec<_> = self
                    .core
                    .sockets
                    .iter_mut()
                    .zip(polled)
                    .filter(|(_, polled)| *polled)
                    .map(|((role, socket), _)| {
                        let role = *role;
                        Box::pin(async move { (role, socket.recv().await) })
                    })
                    .collect();

                if waits.is_empty() {
                    tokio::time::sleep(timeout).await;
                    None
                } else {
                    match tokio::time::timeout(timeout, select_all(waits)).await {
                        Ok(((role, result), _, _)) => Some((role, result)),
                        Err(_) => None,
                    }
                }
            };

            match ready {
                None => self.housekeeping().await,
                Some((role, Ok(frames))) => {
                    self.dispatch(role, frames).await;
                    if self.last_housekeeping.elapsed() >= timeout {
                        self.housekeeping().await;
                    }
                }
                Some((role, Err(e))) => match e.severity() {
                    Severity::Transient => {
                        warn!(
                            "Station {}: receive on {} failed: {}",
                            self.core.name,
                            role.as_str(),
                            e
                        );
                        self.core.bump(role.error_counter());
                    }
                    Severity::Fatal => {
                        error!(
                            "Station {}: fatal error on {}: {}",
                            self.core.name,
                            role.as_str(),
                            e
                        );
                        return PollExit::Failed(e.to_string());
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, role: SocketRole, frames: Vec<Bytes>) {
        let core = &mut self.core;
        let handler = self.handler.as_mut();
        match role {
            SocketRole::RequestExternal | SocketRole::RequestLoopback => {
                router::on_request(core, handler, role, frames).await
            }
            SocketRole::WorkerIn => collector::on_response(core, handler, frames).await,
            SocketRole::WorkerOut => {
                core.bump(Counter::WorkerIn);
                // participants answer ballots on worker_out
                if core.global().api_route_mode && core.station_type != StationType::Vote {
                    router::on_request(core, handler, role, frames).await
                } else {
                    handler.worker_out_message(core, frames).await
                }
            }
            _ => debug!("Station {}: unexpected traffic on {}", core.name, role.as_str()),
        }
    }

    /// Drop silent workers and stale jobs
    async fn housekeeping(&mut self) {
        self.last_housekeeping = Instant::now();
        let now = Instant::now();
        let global = self.core.fabric.global.clone();

        let gone = self
            .core
            .fabric
            .directory
            .with_workers(&self.core.name, |w| w.sweep(now, global.worker_timeout()))
            .unwrap_or_default();
        for (address, worker) in gone {
            info!(
                "Station {}: worker {} ({}) timed out",
                self.core.name,
                worker.flow_name,
                crate::transport::identity_label(&address)
            );
            self.core.emit(EventKind::WorkerLeft, Some(worker.flow_name));
        }

        for job in self.core.jobs.expire(now, global.job_timeout()) {
            warn!(
                "Station {}: job {} abandoned after {:?}",
                self.core.name,
                crate::types::format_global_id(job.global_id),
                global.job_timeout()
            );
            self.core.bump(Counter::RequestErr);
            self.core
                .trace(&job.request, TracePoint::End, Some(Status::Error.as_str()))
                .await;
        }
    }

    /// Close every socket and mark the station stopped
    pub async fn destruct(&mut self) {
        let abandoned = self.core.jobs.drain();
        if !abandoned.is_empty() {
            debug!(
                "Station {}: dropping {} open jobs",
                self.core.name,
                abandoned.len()
            );
        }
        self.core.close_sockets().await;
        let name = self.core.name.clone();
        self.core.fabric.directory.transition(&name, |s| {
            (s != StationState::Failed).then_some(StationState::Stopped)
        });
        self.core.emit(EventKind::Left, None);
        info!("Station {}: stopped", name);
    }

    /// Initialize, poll and tear down
    pub async fn run(mut self) -> Result<PollExit, StationError> {
        match self.initialize().await {
            Ok(()) => {}
            Err(StationError::ClosedBeforeStart(_)) => return Ok(PollExit::Closed),
            Err(e) => return Err(e),
        }
        let exit = self.poll().await;
        self.destruct().await;
        Ok(exit)
    }
}
