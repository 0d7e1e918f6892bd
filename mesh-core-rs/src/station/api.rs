//! Handlers for API, publishing, trace and dispatcher stations

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Job, JobKind, SocketRole, StationCore, StationHandler};
use crate::frame::{Envelope, FrameType, Tag, TracePoint};
use crate::registry::Counter;
use crate::transport::identity_label;
use crate::types::{parse_global_id, Status};

/// Forwards jobs to ready workers, round robin
#[derive(Debug, Default)]
pub struct ApiStation;

#[async_trait]
impl StationHandler for ApiStation {
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        role: SocketRole,
        env: Envelope,
        _kind: JobKind,
    ) {
        let Some(global_id) = env.frame(FrameType::GlobalId).and_then(|f| parse_global_id(f)) else {
            core.reply_status(role, env.address().clone(), Status::FrameInvalid)
                .await;
            return;
        };

        let name = core.name.clone();
        let worker = core
            .fabric
            .directory
            .with_workers(&name, |w| w.next_ready())
            .flatten();
        let Some(worker) = worker else {
            debug!("Station {}: no ready worker", name);
            core.reply_status(role, env.address().clone(), Status::NotWorker)
                .await;
            core.trace(&env, TracePoint::End, Some(Status::NotWorker.as_str()))
                .await;
            return;
        };

        let mut forward = env.clone();
        forward.strip_service_key();
        if forward.frame(FrameType::Requester).is_none() {
            forward.append_frame(FrameType::Requester, env.address().clone());
        }
        forward.set_address(worker.clone());

        match core.send(SocketRole::WorkerOut, forward).await {
            Ok(()) => {
                debug!(
                    "Station {}: job handed to {}",
                    name,
                    identity_label(&worker)
                );
                core.bump(Counter::WorkerOut);
                core.trace(&env, TracePoint::Forward, None).await;
                core.jobs
                    .insert(Job::new(global_id, role, env).with_worker(worker));
            }
            Err(e) => {
                warn!(
                    "Station {}: dispatch to {} failed: {}",
                    name,
                    identity_label(&worker),
                    e
                );
                core.bump(Counter::RequestErr);
                core.reply_status(role, env.address().clone(), Status::SendError)
                    .await;
            }
        }
    }
}

/// Notify and queue stations: publish the request to every subscriber
#[derive(Debug, Default)]
pub struct PublishStation;

#[async_trait]
impl StationHandler for PublishStation {
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        role: SocketRole,
        env: Envelope,
        _kind: JobKind,
    ) {
        let requester = env.address().clone();
        let mut publish = env.clone();
        publish.strip_service_key();

        let status = match core.send(SocketRole::WorkerOut, publish).await {
            Ok(()) => {
                core.bump(Counter::WorkerOut);
                Status::Ok
            }
            Err(e) => {
                warn!("Station {}: publish failed: {}", core.name, e);
                core.bump(Counter::RequestErr);
                Status::SendError
            }
        };
        core.reply_status(role, requester, status).await;
        core.trace(&env, TracePoint::End, Some(status.as_str()))
            .await;
    }
}

/// Consumes trace records and logs them
#[derive(Debug, Default)]
pub struct TraceSink {
    records: u64,
}

impl TraceSink {
    pub fn records(&self) -> u64 {
        self.records
    }
}

fn text(env: &Envelope, frame_type: FrameType) -> String {
    env.frame(frame_type)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_else(|| "-".to_string())
}

#[async_trait]
impl StationHandler for TraceSink {
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        _role: SocketRole,
        env: Envelope,
        _kind: JobKind,
    ) {
        self.records += 1;
        let point = match env.description().tag() {
            Tag::Trace(TracePoint::In) => "in",
            Tag::Trace(TracePoint::Forward) => "forward",
            Tag::Trace(TracePoint::End) => "end",
            _ => "untagged",
        };
        info!(
            "Trace: {} {} job {} at {} status {}",
            text(&env, FrameType::StationType),
            text(&env, FrameType::StationId),
            text(&env, FrameType::GlobalId),
            point,
            text(&env, FrameType::Status)
        );
        debug!("Trace: {} records on {}", self.records, core.name);
    }
}

/// Plan, proxy and trace dispatcher endpoints
///
/// Requests are acknowledged with `ok`; end notifications and trace records
/// are consumed without a reply.
#[derive(Debug, Default)]
pub struct DispatchStation;

#[async_trait]
impl StationHandler for DispatchStation {
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        role: SocketRole,
        env: Envelope,
        _kind: JobKind,
    ) {
        match env.description().tag() {
            Tag::ResultEnd | Tag::Trace(_) => {
                debug!(
                    "Station {}: consumed {:?} from {}",
                    core.name,
                    env.description().tag(),
                    text(&env, FrameType::StationId)
                );
            }
            _ => {
                let mut ack = Envelope::status(role.origin(), env.address().clone(), Status::Ok.as_str());
                if let Some(id) = env.frame(FrameType::GlobalId) {
                    ack.append_frame(FrameType::GlobalId, id.clone());
                }
                core.reply(role, ack).await;
            }
        }
    }
}
