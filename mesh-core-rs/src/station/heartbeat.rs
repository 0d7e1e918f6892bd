//! Worker presence protocol
//!
//! Workers announce themselves with `join` (carrying their flow name), flag
//! `ready` when they accept jobs, send `pitpat` to stay alive and `left` on
//! the way out. Only `join` is answered. Jobs are never touched here.

use tracing::{debug, info, warn};

use super::{SocketRole, StationCore};
use crate::events::EventKind;
use crate::frame::{Command, Envelope, Tag};
use crate::registry::Counter;
use crate::transport::identity_label;
use crate::types::Status;

pub async fn on_heartbeat(core: &mut StationCore, role: SocketRole, env: Envelope) {
    let address = env.address().clone();
    let name = core.name.clone();
    let directory = core.fabric.directory.clone();

    match env.description().command() {
        Command::HeartJoin => {
            let flow = env
                .payload()
                .first()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            let joined = directory.with_workers(&name, |w| w.join(address.clone(), &flow));
            match joined {
                Some(Ok(fresh)) => {
                    if fresh {
                        info!(
                            "Station {}: worker {} joined as {}",
                            name,
                            identity_label(&address),
                            flow
                        );
                        core.emit(EventKind::WorkerJoin, Some(flow));
                    } else {
                        debug!("Station {}: worker {} rejoined", name, flow);
                    }
                    let mut welcome = Envelope::status(role.origin(), address, Status::Welcome.as_str());
                    welcome.description_mut().set_command(Command::HeartJoin);
                    welcome.description_mut().set_tag(Tag::ExtendEnd);
                    core.reply(role, welcome).await;
                }
                Some(Err(reason)) => {
                    warn!(
                        "Station {}: join from {} refused ({:?}: {:?})",
                        name,
                        identity_label(&address),
                        reason,
                        flow
                    );
                    core.bump(Counter::WorkerErr);
                    core.reply_status(role, address, Status::DenyError).await;
                }
                None => {}
            }
        }
        Command::HeartReady => {
            if directory.with_workers(&name, |w| w.mark_ready(&address)) != Some(true) {
                debug!(
                    "Station {}: ready from unknown worker {}",
                    name,
                    identity_label(&address)
                );
            }
        }
        Command::HeartPitpat => {
            directory.with_workers(&name, |w| w.touch(&address));
        }
        Command::HeartLeft => {
            if let Some(Some(worker)) = directory.with_workers(&name, |w| w.leave(&address)) {
                info!("Station {}: worker {} left", name, worker.flow_name);
                core.emit(EventKind::WorkerLeft, Some(worker.flow_name));
            }
        }
        other => {
            debug!("Station {}: {:?} is not a heartbeat", name, other);
            core.bump(Counter::WorkerErr);
        }
    }
}
