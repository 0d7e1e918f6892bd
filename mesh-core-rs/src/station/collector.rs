//! Response collector for the `WorkerIn` socket

use bytes::Bytes;
use tracing::debug;

use super::{heartbeat, SocketRole, StationCore, StationHandler};
use crate::frame::{is_ping_request, Envelope, Origin, Tag, PING_MARKER};
use crate::registry::Counter;
use crate::transport::identity_label;
use crate::types::Status;

pub async fn on_response(core: &mut StationCore, handler: &mut dyn StationHandler, raw: Vec<Bytes>) {
    core.bump(Counter::WorkerIn);

    if raw.len() == 2 && is_ping_request(&raw) {
        if let Err(e) = core.send_raw(SocketRole::WorkerIn, raw).await {
            debug!("Station {}: ping echo failed: {}", core.name, e);
        }
        return;
    }

    if raw.len() < 3 {
        debug!(
            "Station {}: dropping {}-frame worker message",
            core.name,
            raw.len()
        );
        core.bump(Counter::WorkerErr);
        return;
    }

    let address = raw[0].clone();
    let keyed = raw
        .last()
        .map(|k| k == core.service_key())
        .unwrap_or(false);
    if !keyed {
        debug!(
            "Station {}: worker {} sent a bad service key",
            core.name,
            identity_label(&address)
        );
        core.bump(Counter::WorkerErr);
        core.reply_status(SocketRole::WorkerIn, address, Status::DenyError)
            .await;
        return;
    }

    let env = match Envelope::from_frames(raw, Origin::External) {
        Ok(env) => env,
        Err(e) => {
            debug!("Station {}: undecodable worker message: {}", core.name, e);
            core.bump(Counter::WorkerErr);
            return;
        }
    };
    if let Err(e) = env.check_frame_limit() {
        debug!("Station {}: worker message refused: {}", core.name, e);
        core.bump(Counter::WorkerErr);
        return;
    }

    let name = core.name.clone();
    core.fabric
        .directory
        .with_workers(&name, |w| w.touch(&address));

    if env.description().tag() == Tag::ExtendEnd || env.description().command().is_heartbeat() {
        core.unbump(Counter::WorkerIn);
        heartbeat::on_heartbeat(core, SocketRole::WorkerIn, env).await;
        return;
    }

    let ack = vec![address, Bytes::from_static(PING_MARKER)];
    if let Err(e) = core.send_raw(SocketRole::WorkerIn, ack).await {
        debug!("Station {}: worker ack failed: {}", core.name, e);
    }
    handler.job_end(core, env).await;
}
