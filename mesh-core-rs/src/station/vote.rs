//! Voting coordinator
//!
//! Client requests look like
//!
//! ```text
//! [addr][desc][token][command][argument?][global id][key]
//! ```
//!
//! where the command is the leading character of frame 3:
//!
//! | command | effect |
//! |---------|--------|
//! | `*` | list participant flow names |
//! | `$` | read the ballot |
//! | `@` | start a round and push it to every participant |
//! | `%` | mark the round `waiting` |
//! | `v` | mark the round `-end` |
//! | `x` | close the round and let it expire |
//!
//! Replies are `[token][marker][body ...][status]` tagged `result_end`. The
//! marker is `&` for the participant list, `$` for reads, the command
//! character for round changes and `+` for redelivery. Participant results
//! arrive on `WorkerOut` and are relayed to the client on record with the
//! participant's flow name as marker.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{heartbeat, JobKind, SocketRole, StationCore, StationHandler};
use crate::ballot::{
    ballot_key, Ballot, BallotStatus, VoteCommand, ARGUMENT_FIELD, CLIENT_FIELD, ERROR_MARK,
    SENT_MARK, STATUS_FIELD,
};
use crate::error::{StoreError, TransportError};
use crate::frame::{Command, Description, Envelope, FrameType, Origin, Tag, EXTENSION_BASE};
use crate::registry::Counter;
use crate::transport::identity_label;
use crate::types::Status;

/// Extension command that re-pushes a round to pending participants
pub const VOTE_REPUSH: u8 = EXTENSION_BASE;

const LIST_MARKER: &[u8] = b"&";
const READ_MARKER: &[u8] = b"$";
const REPUSH_MARKER: &[u8] = b"+";

/// Outcome of a redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RePush {
    pub resent: usize,
    pub failed: usize,
}

/// Vote station handler
#[derive(Debug, Default)]
pub struct VoteStation;

impl VoteStation {
    pub fn new() -> Self {
        Self
    }
}

/// Client request fields
struct VoteRequest {
    role: SocketRole,
    address: Bytes,
    token: Bytes,
    command: Bytes,
    argument: Option<Bytes>,
    global_id: Option<Bytes>,
}

impl VoteRequest {
    fn parse(role: SocketRole, env: &Envelope) -> Option<Self> {
        let token = env.frame_at(2)?.clone();
        let command = env.frame_at(3)?.clone();
        let argument = match env.description().frame_type_at(4) {
            Some(FrameType::GlobalId) | Some(FrameType::ServiceKey) | None => None,
            Some(_) => env.frame_at(4).cloned(),
        };
        Some(Self {
            role,
            address: env.address().clone(),
            token,
            command,
            argument,
            global_id: env.frame(FrameType::GlobalId).cloned(),
        })
    }

    fn token_str(&self) -> String {
        String::from_utf8_lossy(&self.token).into_owned()
    }
}

fn vote_reply(
    origin: Origin,
    address: Bytes,
    token: &Bytes,
    marker: &[u8],
    body: Vec<Bytes>,
    status: &str,
) -> Envelope {
    let mut env = Envelope::new(
        origin,
        address,
        Description::new(Command::None).with_tag(Tag::ResultEnd),
    )
    .with_frame(FrameType::RequestId, token.clone())
    .with_frame(FrameType::Command, Bytes::copy_from_slice(marker));
    for frame in body {
        env.append_frame(FrameType::Content, frame);
    }
    env.with_frame(FrameType::Status, Bytes::copy_from_slice(status.as_bytes()))
}

fn json_body<T: serde::Serialize>(value: &T) -> Vec<Bytes> {
    match serde_json::to_vec(value) {
        Ok(json) => vec![Bytes::from(json)],
        Err(_) => Vec::new(),
    }
}

fn store_key(core: &StationCore, token: &str) -> String {
    ballot_key(core.global().vote_namespace, &core.name, token)
}

async fn answer(
    core: &mut StationCore,
    req: &VoteRequest,
    marker: &[u8],
    body: Vec<Bytes>,
    status: &str,
) {
    let reply = vote_reply(
        req.role.origin(),
        req.address.clone(),
        &req.token,
        marker,
        body,
        status,
    );
    core.reply(req.role, reply).await;
}

/// Push the round to one participant over `WorkerOut`
async fn push(
    core: &mut StationCore,
    address: &Bytes,
    token: &Bytes,
    argument: Option<&Bytes>,
    global_id: Option<&Bytes>,
) -> bool {
    let mut env = Envelope::new(
        Origin::External,
        address.clone(),
        Description::new(Command::None),
    )
    .with_frame(FrameType::RequestId, token.clone())
    .with_frame(FrameType::Command, Bytes::from_static(b"@"));
    if let Some(argument) = argument {
        env.append_frame(FrameType::Argument, argument.clone());
    }
    if let Some(id) = global_id {
        env.append_frame(FrameType::GlobalId, id.clone());
    }
    match core.send(SocketRole::WorkerOut, env).await {
        Ok(()) => {
            core.bump(Counter::WorkerOut);
            true
        }
        Err(e) => {
            warn!(
                "Vote: push to {} failed: {}",
                identity_label(address),
                e
            );
            core.bump(Counter::WorkerErr);
            false
        }
    }
}

fn participants(core: &StationCore) -> Vec<(Bytes, String)> {
    core.fabric
        .directory
        .with_workers(&core.name, |w| w.participants())
        .unwrap_or_default()
}

async fn list(core: &mut StationCore, req: &VoteRequest) {
    let mut names: Vec<String> = participants(core).into_iter().map(|(_, n)| n).collect();
    names.sort();
    answer(core, req, LIST_MARKER, json_body(&names), Status::Ok.as_str()).await;
}

async fn read(core: &mut StationCore, req: &VoteRequest) -> Result<(), StoreError> {
    let key = store_key(core, &req.token_str());
    match Ballot::load(core.fabric.store.as_ref(), &key)? {
        Some(ballot) => {
            let status = ballot.raw_status().unwrap_or(Status::Error.as_str()).to_string();
            let body = json_body(&ballot.participants());
            answer(core, req, READ_MARKER, body, &status).await;
        }
        None => {
            answer(core, req, READ_MARKER, Vec::new(), Status::Error.as_str()).await;
        }
    }
    Ok(())
}

async fn start(core: &mut StationCore, req: &VoteRequest) -> Result<(), StoreError> {
    let token = req.token_str();
    let key = store_key(core, &token);
    let store = core.fabric.store.clone();

    if let Some(existing) = Ballot::load(store.as_ref(), &key)? {
        if existing.status().map(BallotStatus::is_active).unwrap_or(true) {
            debug!("Vote: round {} already active", token);
            answer(core, req, &req.command, Vec::new(), Status::Error.as_str()).await;
            return Ok(());
        }
        store.delete(&key)?;
    }

    let argument = req
        .argument
        .as_ref()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .unwrap_or_default();
    let client = identity_label(&req.address);
    store.set_fields(
        &key,
        &[
            (STATUS_FIELD, BallotStatus::Start.as_str()),
            (ARGUMENT_FIELD, argument.as_str()),
            (CLIENT_FIELD, client.as_str()),
        ],
    )?;

    let targets = participants(core);
    let mut reached = 0;
    for (address, flow) in &targets {
        let ok = push(
            core,
            address,
            &req.token,
            req.argument.as_ref(),
            req.global_id.as_ref(),
        )
        .await;
        if ok {
            reached += 1;
        }
        store.set_field(&key, flow, if ok { SENT_MARK } else { ERROR_MARK })?;
    }
    if reached > 0 {
        store.set_field(&key, STATUS_FIELD, BallotStatus::Sent.as_str())?;
    }

    info!(
        "Vote: START {} pushed to {}/{} participants",
        token,
        reached,
        targets.len()
    );

    let fields = Ballot::load(store.as_ref(), &key)?
        .map(|b| b.participants())
        .unwrap_or_default();
    let status = if reached == targets.len() {
        Status::Ok
    } else {
        Status::SendError
    };
    answer(core, req, &req.command, json_body(&fields), status.as_str()).await;
    Ok(())
}

async fn transition(
    core: &mut StationCore,
    req: &VoteRequest,
    command: VoteCommand,
) -> Result<(), StoreError> {
    let token = req.token_str();
    let key = store_key(core, &token);
    let store = core.fabric.store.clone();

    let current = Ballot::load(store.as_ref(), &key)?.and_then(|b| b.status());
    let (Some(current), Some(target)) = (current, command.target()) else {
        answer(core, req, &req.command, Vec::new(), Status::Error.as_str()).await;
        return Ok(());
    };
    if !current.can_move_to(target) {
        debug!(
            "Vote: {} cannot move from {} to {}",
            token,
            current.as_str(),
            target.as_str()
        );
        answer(core, req, &req.command, Vec::new(), Status::Error.as_str()).await;
        return Ok(());
    }

    store.set_field(&key, STATUS_FIELD, target.as_str())?;
    info!("Vote: {} {} -> {}", token, current.as_str(), target.as_str());

    let status = if target == BallotStatus::Closed {
        store.expire(&key, core.global().ballot_ttl())?;
        Status::Bye.as_str()
    } else {
        target.as_str()
    };
    answer(core, req, &req.command, Vec::new(), status).await;
    Ok(())
}

/// Re-send a round to every participant whose value is still pending
///
/// `client` becomes the new notification address. Reached participants are
/// marked sent; unreachable ones keep their pending value. Returns `None`
/// when the ballot does not exist.
pub async fn re_push_vote(
    core: &mut StationCore,
    token: &Bytes,
    client: &Bytes,
) -> Result<Option<RePush>, StoreError> {
    let token_str = String::from_utf8_lossy(token).into_owned();
    let key = store_key(core, &token_str);
    let store = core.fabric.store.clone();

    let Some(ballot) = Ballot::load(store.as_ref(), &key)? else {
        return Ok(None);
    };
    store.set_field(&key, CLIENT_FIELD, &identity_label(client))?;

    let argument = ballot.argument().map(|a| Bytes::copy_from_slice(a.as_bytes()));
    let mut outcome = RePush {
        resent: 0,
        failed: 0,
    };
    for flow in ballot.pending() {
        let address = core
            .fabric
            .directory
            .with_workers(&core.name, |w| w.address_of(&flow))
            .flatten();
        let ok = match address {
            Some(address) => push(core, &address, token, argument.as_ref(), None).await,
            None => {
                debug!("Vote: participant {} is not connected", flow);
                false
            }
        };
        // a failed redelivery stays pending for the next re-push
        if ok {
            outcome.resent += 1;
            store.set_field(&key, &flow, SENT_MARK)?;
        } else {
            outcome.failed += 1;
        }
    }
    info!(
        "Vote: RE-PUSH {} resent {} failed {}",
        token_str, outcome.resent, outcome.failed
    );
    Ok(Some(outcome))
}

/// Send to the client on whichever request socket knows it
async fn relay(core: &mut StationCore, client: Bytes, token: &Bytes, flow: &str, value: &Bytes) {
    for role in [SocketRole::RequestExternal, SocketRole::RequestLoopback] {
        let env = vote_reply(
            role.origin(),
            client.clone(),
            token,
            flow.as_bytes(),
            vec![value.clone()],
            Status::Ok.as_str(),
        );
        match core.send(role, env).await {
            Ok(()) => {
                core.bump(Counter::RequestOut);
                return;
            }
            Err(TransportError::Unroutable(_)) | Err(TransportError::NoSocket(_)) => continue,
            Err(e) => {
                warn!("Vote: relay to {} failed: {}", identity_label(&client), e);
                core.bump(Counter::RequestErr);
                return;
            }
        }
    }
    debug!("Vote: client {} is gone", identity_label(&client));
}

/// Record a participant result and notify the client
async fn on_result(core: &mut StationCore, env: Envelope) -> Result<(), StoreError> {
    let address = env.address().clone();
    let flow = core
        .fabric
        .directory
        .with_workers(&core.name, |w| w.get(&address).map(|e| e.flow_name.clone()))
        .flatten();
    let (Some(flow), Some(token), Some(value)) = (
        flow,
        env.frame(FrameType::RequestId).cloned(),
        env.frame(FrameType::Content).cloned(),
    ) else {
        debug!(
            "Vote: unusable result from {}",
            identity_label(&address)
        );
        core.bump(Counter::WorkerErr);
        return Ok(());
    };

    let token_str = String::from_utf8_lossy(&token).into_owned();
    let key = store_key(core, &token_str);
    let store = core.fabric.store.clone();
    let Some(ballot) = Ballot::load(store.as_ref(), &key)? else {
        debug!("Vote: result for gone ballot {} dropped", token_str);
        return Ok(());
    };

    let value_str = String::from_utf8_lossy(&value).into_owned();
    store.set_field(&key, &flow, &value_str)?;
    info!("Vote: {} answered {} = {}", flow, token_str, value_str);

    if let Some(client) = ballot.client() {
        let client = Bytes::copy_from_slice(client.as_bytes());
        relay(core, client, &token, &flow, &value).await;
    }
    Ok(())
}

#[async_trait]
impl StationHandler for VoteStation {
    async fn job_start(
        &mut self,
        core: &mut StationCore,
        role: SocketRole,
        env: Envelope,
        _kind: JobKind,
    ) {
        let Some(req) = VoteRequest::parse(role, &env) else {
            core.reply_status(role, env.address().clone(), Status::Error)
                .await;
            return;
        };

        let outcome = match VoteCommand::parse(&req.command) {
            None => {
                answer(core, &req, &req.command, Vec::new(), Status::Error.as_str()).await;
                Ok(())
            }
            Some(VoteCommand::List) => {
                list(core, &req).await;
                Ok(())
            }
            Some(VoteCommand::Read) => read(core, &req).await,
            Some(VoteCommand::Start) => start(core, &req).await,
            Some(cmd) => transition(core, &req, cmd).await,
        };

        if let Err(e) = outcome {
            warn!("Vote: store failure for {}: {}", req.token_str(), e);
            core.bump(Counter::RequestErr);
            answer(core, &req, &req.command, Vec::new(), Status::Error.as_str()).await;
        }
    }

    async fn extension_command(&mut self, core: &mut StationCore, role: SocketRole, env: Envelope) {
        if env.description().command() != Command::Extension(VOTE_REPUSH) {
            core.reply_status(role, env.address().clone(), Status::Error)
                .await;
            return;
        }
        let Some(token) = env.frame_at(2).cloned() else {
            core.reply_status(role, env.address().clone(), Status::Error)
                .await;
            return;
        };
        let client = env.address().clone();
        let status = match re_push_vote(core, &token, &client).await {
            Ok(Some(outcome)) if outcome.failed == 0 => Status::Ok,
            Ok(Some(_)) => Status::SendError,
            Ok(None) => Status::Error,
            Err(e) => {
                warn!("Vote: store failure on re-push: {}", e);
                core.bump(Counter::RequestErr);
                Status::Error
            }
        };
        let reply = vote_reply(
            role.origin(),
            client,
            &token,
            REPUSH_MARKER,
            Vec::new(),
            status.as_str(),
        );
        core.reply(role, reply).await;
    }

    async fn worker_out_message(&mut self, core: &mut StationCore, frames: Vec<Bytes>) {
        let env = match Envelope::decode(frames, Origin::External)
            .and_then(|env| env.check_frame_limit().map(|_| env))
        {
            Ok(env) => env,
            Err(e) => {
                debug!("Vote: undecodable worker message: {}", e);
                core.bump(Counter::WorkerErr);
                return;
            }
        };

        if !env.has_service_key(core.service_key()) {
            debug!(
                "Vote: participant {} sent a bad service key",
                identity_label(env.address())
            );
            core.bump(Counter::WorkerErr);
            core.reply_status(SocketRole::WorkerOut, env.address().clone(), Status::DenyError)
                .await;
            return;
        }

        if env.description().tag() == Tag::ExtendEnd || env.description().command().is_heartbeat() {
            core.unbump(Counter::WorkerIn);
            heartbeat::on_heartbeat(core, SocketRole::WorkerOut, env).await;
            return;
        }

        if let Err(e) = on_result(core, env).await {
            warn!("Vote: store failure on result: {}", e);
            core.bump(Counter::WorkerErr);
        }
    }
}
