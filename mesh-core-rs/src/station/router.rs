//! Request router
//!
//! Every message on a request socket (and on `WorkerOut` in API-route mode)
//! goes through [`on_request`]:
//!
//! 1. fewer than two frames: counted and dropped
//! 2. ping marker in frame 1: `ok`
//! 3. simple commands (ping, plan, global id, heartbeats)
//! 4. invalid command or frame size: `frame_invalid`
//! 5. external traffic without the service key: `deny_error`
//! 6. paused station: `pause`
//! 7. extension commands go to the handler, everything else becomes a job

use bytes::Bytes;
use tracing::debug;

use super::{heartbeat, JobKind, SocketRole, StationCore, StationHandler};
use crate::frame::{
    is_ping_request, strip_delimiter, Command, Description, Envelope, FrameType, Origin, Tag,
    TracePoint,
};
use crate::registry::Counter;
use crate::transport::identity_label;
use crate::types::{format_global_id, parse_global_id, StationState, StationType, Status};

pub async fn on_request(
    core: &mut StationCore,
    handler: &mut dyn StationHandler,
    role: SocketRole,
    raw: Vec<Bytes>,
) {
    let origin = role.origin();
    let frames = strip_delimiter(raw, origin);
    if frames.len() < 2 {
        core.bump(Counter::RequestErr);
        debug!(
            "Station {}: dropping {}-frame message on {}",
            core.name,
            frames.len(),
            role.as_str()
        );
        return;
    }
    core.bump(Counter::RequestIn);

    if is_ping_request(&frames) {
        core.reply_status(role, frames[0].clone(), Status::Ok).await;
        return;
    }

    let address = frames[0].clone();
    let env = match Envelope::from_frames(frames, origin) {
        Ok(env) => env,
        Err(e) => {
            debug!("Station {}: undecodable request: {}", core.name, e);
            core.bump(Counter::RequestErr);
            core.reply_status(role, address, Status::FrameInvalid).await;
            return;
        }
    };

    if simple_command(core, role, &env).await {
        return;
    }

    if let Err(e) = env.validate() {
        debug!("Station {}: invalid request: {}", core.name, e);
        core.bump(Counter::RequestErr);
        core.reply_status(role, env.address().clone(), Status::FrameInvalid)
            .await;
        return;
    }

    if origin == Origin::External && !env.has_service_key(core.service_key()) {
        debug!(
            "Station {}: request from {} denied",
            core.name,
            identity_label(env.address())
        );
        core.bump(Counter::RequestErr);
        core.reply_status(role, env.address().clone(), Status::DenyError)
            .await;
        return;
    }

    if core.state() == StationState::Paused {
        core.reply_status(role, env.address().clone(), Status::Pause)
            .await;
        return;
    }

    if let Command::Extension(_) = env.description().command() {
        handler.extension_command(core, role, env).await;
        return;
    }

    start_job(core, handler, role, env).await;
}

/// Mint or reuse the global id and hand the job to the handler
async fn start_job(
    core: &mut StationCore,
    handler: &mut dyn StationHandler,
    role: SocketRole,
    mut env: Envelope,
) {
    let embedded = env
        .frame(FrameType::GlobalId)
        .and_then(|f| parse_global_id(f));
    let kind = match embedded {
        Some(id) => {
            debug!("Station {}: resuming job {}", core.name, format_global_id(id));
            JobKind::Resumed
        }
        None => {
            let id = core.fabric.ids.next_id();
            env.append_frame(FrameType::GlobalId, Bytes::from(format_global_id(id)));
            debug!("Station {}: new job {}", core.name, format_global_id(id));
            JobKind::New
        }
    };
    core.trace(&env, TracePoint::In, None).await;
    handler.job_start(core, role, env, kind).await;
}

/// Commands answered without a job; returns whether `env` was consumed
async fn simple_command(core: &mut StationCore, role: SocketRole, env: &Envelope) -> bool {
    match env.description().command() {
        Command::Ping => {
            core.reply_status(role, env.address().clone(), Status::Ok)
                .await;
            true
        }
        Command::Plan if core.station_type != StationType::Plan => {
            forward_plan(core, role, env.clone()).await;
            true
        }
        Command::GlobalId => {
            reply_global_id(core, role, env).await;
            true
        }
        cmd if cmd.is_heartbeat() => {
            heartbeat::on_heartbeat(core, role, env.clone()).await;
            true
        }
        _ => false,
    }
}

async fn reply_global_id(core: &mut StationCore, role: SocketRole, env: &Envelope) {
    let id = core.fabric.ids.next_id();
    let mut reply = Envelope::new(
        role.origin(),
        env.address().clone(),
        Description::new(Command::GlobalId).with_tag(Tag::ResultEnd),
    )
    .with_frame(FrameType::GlobalId, Bytes::from(format_global_id(id)));
    for frame_type in [FrameType::Requester, FrameType::RequestId] {
        if let Some(value) = env.frame(frame_type) {
            reply.append_frame(frame_type, value.clone());
        }
    }
    core.reply(role, reply).await;
}

/// Ask the plan dispatcher and relay its single reply
async fn forward_plan(core: &mut StationCore, role: SocketRole, env: Envelope) {
    let requester = env.address().clone();
    let mut request = env;
    request.strip_service_key();
    request.append_frame(FrameType::StationId, Bytes::from(core.name.clone()));

    core.drain(SocketRole::PlanDispatch).await;
    if let Err(e) = core.send(SocketRole::PlanDispatch, request).await {
        debug!("Station {}: plan forward failed: {}", core.name, e);
        core.bump(Counter::RequestErr);
        core.reply_status(role, requester, Status::SendError).await;
        return;
    }

    let timeout = core.global().plan_timeout();
    let reply = match core.recv_timeout(SocketRole::PlanDispatch, timeout).await {
        Ok(frames) => {
            let mut framed = Vec::with_capacity(frames.len() + 1);
            framed.push(requester.clone());
            framed.extend(frames);
            Envelope::from_frames(framed, role.origin()).ok()
        }
        Err(e) => {
            debug!("Station {}: no plan reply: {}", core.name, e);
            None
        }
    };

    match reply {
        Some(mut reply) => {
            reply.strip_service_key();
            reply.description_mut().set_tag(Tag::ResultEnd);
            core.reply(role, reply).await;
        }
        None => {
            core.bump(Counter::RequestErr);
            core.reply_status(role, requester, Status::RecvError).await;
        }
    }
}
