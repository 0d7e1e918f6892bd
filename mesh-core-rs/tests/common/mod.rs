//! Helpers shared by the station integration tests
//!
//! Stations run on an in-memory fabric; clients and workers are Dealer
//! sockets on the same hub.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use mesh_core::error::StationError;
use mesh_core::frame::{Command, Description, Envelope, FrameType, Origin, Tag};
use mesh_core::station::{Fabric, PollExit, Station};
use mesh_core::transport::{FrameSocket, SocketKind};
use mesh_core::{GlobalConfig, StationConfig, StationState};
use tokio::task::JoinHandle;

pub const KEY: &[u8] = b"mesh";
pub const WAIT: Duration = Duration::from_secs(2);

pub fn global() -> GlobalConfig {
    GlobalConfig::default()
        .with_service_key("mesh")
        .with_poll_timeout(Duration::from_millis(20))
}

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Register and run a station, returning once it is running
pub async fn start(
    fabric: &Fabric,
    config: StationConfig,
) -> JoinHandle<Result<PollExit, StationError>> {
    let name = config.station_name.clone();
    fabric.register(config);
    let station = Station::new(&name, fabric.clone()).unwrap();
    let handle = tokio::spawn(station.run());
    wait_for(|| fabric.directory.state(&name) == Some(StationState::Running)).await;
    handle
}

/// Poll `check` until it holds or the test deadline passes
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Dealer connected to a TCP port of the fabric
pub async fn dealer(fabric: &Fabric, port: u16, identity: &str) -> Box<dyn FrameSocket> {
    fabric
        .sockets
        .connect(SocketKind::Dealer, &fabric.tcp_endpoint(port), Some(b(identity)))
        .await
        .unwrap()
}

/// Unaddressed external request: `[desc][frames ...][key]`
pub fn request(command: Command, frames: &[(FrameType, &str)], key: &[u8]) -> Vec<Bytes> {
    let mut desc = Description::new(command);
    for (frame_type, _) in frames {
        desc = desc.with_frame(*frame_type);
    }
    desc = desc.with_frame(FrameType::ServiceKey);

    let mut raw = vec![desc.to_bytes()];
    raw.extend(frames.iter().map(|(_, v)| b(v)));
    raw.push(Bytes::copy_from_slice(key));
    raw
}

/// Heartbeat from a worker: `[desc][payload ...][key]` tagged `extend_end`
pub fn heartbeat(command: Command, payload: &[&str]) -> Vec<Bytes> {
    heartbeat_with_key(command, payload, KEY)
}

pub fn heartbeat_with_key(command: Command, payload: &[&str], key: &[u8]) -> Vec<Bytes> {
    let mut desc = Description::new(command).with_tag(Tag::ExtendEnd);
    for _ in payload {
        desc = desc.with_frame(FrameType::Content);
    }
    desc = desc.with_frame(FrameType::ServiceKey);

    let mut raw = vec![desc.to_bytes()];
    raw.extend(payload.iter().map(|p| b(p)));
    raw.push(Bytes::copy_from_slice(key));
    raw
}

/// Receive on a dealer and decode as an external envelope
pub async fn recv_env(socket: &mut Box<dyn FrameSocket>) -> Envelope {
    let frames = tokio::time::timeout(WAIT, socket.recv())
        .await
        .expect("no message in time")
        .unwrap();
    let mut framed = vec![Bytes::from_static(b"station")];
    framed.extend(frames);
    Envelope::decode(framed, Origin::External).unwrap()
}

/// Assert nothing arrives for a short while
pub async fn assert_silent(socket: &mut Box<dyn FrameSocket>) {
    let got = tokio::time::timeout(Duration::from_millis(100), socket.recv()).await;
    assert!(got.is_err(), "unexpected message: {:?}", got);
}

pub fn text(env: &Envelope, frame_type: FrameType) -> String {
    env.frame(frame_type)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_default()
}

pub fn status(env: &Envelope) -> String {
    text(env, FrameType::Status)
}

/// Join a worker over `socket` and wait for the welcome
pub async fn join(socket: &mut Box<dyn FrameSocket>, flow: &str) {
    socket
        .send(heartbeat(Command::HeartJoin, &[flow]))
        .await
        .unwrap();
    let welcome = recv_env(socket).await;
    assert_eq!(status(&welcome), "welcome");
    assert_eq!(welcome.description().tag(), Tag::ExtendEnd);
}
