//! Voting coordinator end to end: rounds, participant results, redelivery

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mesh_core::frame::{Command, Envelope, FrameType, Tag};
use mesh_core::station::vote::VOTE_REPUSH;
use mesh_core::station::Fabric;
use mesh_core::store::{MemoryStore, RecordStore};
use mesh_core::transport::FrameSocket;
use mesh_core::{GlobalConfig, StationConfig, StationType};

const VOTE_PORT: u16 = 7200;
const PARTICIPANTS: u16 = 7202;
const BALLOT: &str = "vote:ballot:T1";

struct Setup {
    fabric: Fabric,
    store: Arc<MemoryStore>,
    client: Box<dyn FrameSocket>,
}

async fn setup() -> Setup {
    setup_with(global()).await
}

async fn setup_with(global: GlobalConfig) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let fabric = Fabric::in_memory(global).with_store(store.clone());
    let config = StationConfig::new("ballot", StationType::Vote, VOTE_PORT)
        .with_worker_ports(7201, PARTICIPANTS);
    let _station = start(&fabric, config).await;
    let client = dealer(&fabric, VOTE_PORT, "client").await;
    Setup {
        fabric,
        store,
        client,
    }
}

async fn participant(fabric: &Fabric, flow: &str) -> Box<dyn FrameSocket> {
    let mut socket = dealer(fabric, PARTICIPANTS, flow).await;
    join(&mut socket, flow).await;
    socket
}

async fn vote(
    client: &mut Box<dyn FrameSocket>,
    token: &str,
    command: &str,
    argument: Option<&str>,
) -> Envelope {
    let mut frames = vec![(FrameType::RequestId, token), (FrameType::Command, command)];
    if let Some(argument) = argument {
        frames.push((FrameType::Argument, argument));
    }
    client
        .send(request(Command::None, &frames, KEY))
        .await
        .unwrap();
    recv_env(client).await
}

async fn re_push(client: &mut Box<dyn FrameSocket>, token: &str) -> Envelope {
    client
        .send(request(
            Command::Extension(VOTE_REPUSH),
            &[(FrameType::RequestId, token)],
            KEY,
        ))
        .await
        .unwrap();
    recv_env(client).await
}

fn fields(store: &MemoryStore) -> BTreeMap<String, String> {
    store.get_all(BALLOT).unwrap()
}

fn body(env: &Envelope) -> BTreeMap<String, String> {
    serde_json::from_str(&text(env, FrameType::Content)).unwrap()
}

#[tokio::test]
async fn test_start_with_one_unreachable_participant() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let mut w1 = participant(&fabric, "w1").await;
    let w2 = participant(&fabric, "w2").await;
    drop(w2);

    let reply = vote(&mut client, "T1", "@", Some("go")).await;
    assert_eq!(reply.description().tag(), Tag::ResultEnd);
    assert_eq!(text(&reply, FrameType::RequestId), "T1");
    assert_eq!(text(&reply, FrameType::Command), "@");
    assert_eq!(status(&reply), "send_error");

    let stored = fields(&store);
    assert_eq!(stored["*"], "sent");
    assert_eq!(stored["#"], "go");
    assert_eq!(stored["@"], "client");
    assert_eq!(stored["w1"], "-sent");
    assert_eq!(stored["w2"], "error");

    let reported = body(&reply);
    assert_eq!(reported.len(), 2);
    assert_eq!(reported["w2"], "error");

    let push = recv_env(&mut w1).await;
    assert_eq!(text(&push, FrameType::RequestId), "T1");
    assert_eq!(text(&push, FrameType::Argument), "go");
    assert!(push.frame(FrameType::GlobalId).is_some());
}

#[tokio::test]
async fn test_participant_result_is_recorded_and_relayed() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let mut w1 = participant(&fabric, "w1").await;

    let reply = vote(&mut client, "T1", "@", Some("go")).await;
    assert_eq!(status(&reply), "ok");
    recv_env(&mut w1).await;

    w1.send(request(
        Command::None,
        &[(FrameType::RequestId, "T1"), (FrameType::Content, "yes")],
        KEY,
    ))
    .await
    .unwrap();

    let update = recv_env(&mut client).await;
    assert_eq!(text(&update, FrameType::RequestId), "T1");
    assert_eq!(text(&update, FrameType::Command), "w1");
    assert_eq!(text(&update, FrameType::Content), "yes");
    assert_eq!(status(&update), "ok");
    assert_eq!(fields(&store)["w1"], "yes");
}

#[tokio::test]
async fn test_results_are_relayed_in_route_mode() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup_with(global().with_api_route_mode(true)).await;
    let mut w1 = participant(&fabric, "w1").await;

    assert_eq!(status(&vote(&mut client, "T1", "@", Some("go")).await), "ok");
    recv_env(&mut w1).await;

    w1.send(request(
        Command::None,
        &[(FrameType::RequestId, "T1"), (FrameType::Content, "no")],
        KEY,
    ))
    .await
    .unwrap();

    let update = recv_env(&mut client).await;
    assert_eq!(text(&update, FrameType::Command), "w1");
    assert_eq!(text(&update, FrameType::Content), "no");
    assert_eq!(fields(&store)["w1"], "no");
}

#[tokio::test]
async fn test_join_with_wrong_key_is_denied() {
    let Setup {
        fabric,
        mut client,
        ..
    } = setup().await;
    let mut stranger = dealer(&fabric, PARTICIPANTS, "w9").await;

    stranger
        .send(heartbeat_with_key(Command::HeartJoin, &["w9"], b"nope"))
        .await
        .unwrap();
    assert_eq!(status(&recv_env(&mut stranger).await), "deny_error");
    assert_eq!(fabric.directory.counters("ballot").unwrap().worker_err, 1);

    let reply = vote(&mut client, "T1", "*", None).await;
    let names: Vec<String> = serde_json::from_str(&text(&reply, FrameType::Content)).unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn test_result_for_missing_ballot_is_dropped() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let mut w1 = participant(&fabric, "w1").await;

    w1.send(request(
        Command::None,
        &[(FrameType::RequestId, "T9"), (FrameType::Content, "yes")],
        KEY,
    ))
    .await
    .unwrap();

    assert_silent(&mut client).await;
    assert!(!store.exists("vote:ballot:T9").unwrap());
}

#[tokio::test]
async fn test_close_keeps_record_until_expiry() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let _w1 = participant(&fabric, "w1").await;

    assert_eq!(status(&vote(&mut client, "T1", "@", Some("go")).await), "ok");
    let reply = vote(&mut client, "T1", "x", None).await;
    assert_eq!(status(&reply), "bye");

    assert_eq!(fields(&store)["*"], "closed");
    let ttl = store.ttl(BALLOT).unwrap();
    assert!(ttl > Duration::from_secs(3500) && ttl <= Duration::from_secs(3600));

    let read = vote(&mut client, "T1", "$", None).await;
    assert_eq!(text(&read, FrameType::Command), "$");
    assert_eq!(status(&read), "closed");
    assert_eq!(body(&read)["w1"], "-sent");
}

#[tokio::test]
async fn test_round_transitions() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let _w1 = participant(&fabric, "w1").await;

    // nothing to move yet
    assert_eq!(status(&vote(&mut client, "T1", "v", None).await), "error");
    assert!(!store.exists(BALLOT).unwrap());

    assert_eq!(status(&vote(&mut client, "T1", "@", None).await), "ok");
    assert_eq!(status(&vote(&mut client, "T1", "@", None).await), "error");
    assert_eq!(status(&vote(&mut client, "T1", "v", None).await), "error");
    assert_eq!(status(&vote(&mut client, "T1", "%", None).await), "waiting");
    assert_eq!(status(&vote(&mut client, "T1", "%", None).await), "error");
    assert_eq!(status(&vote(&mut client, "T1", "v", None).await), "-end");
    assert_eq!(fields(&store)["*"], "-end");
    assert_eq!(status(&vote(&mut client, "T1", "x", None).await), "bye");
    assert_eq!(status(&vote(&mut client, "T1", "x", None).await), "error");

    // a closed round may be started again
    assert_eq!(status(&vote(&mut client, "T1", "@", None).await), "ok");
    assert_eq!(fields(&store)["*"], "sent");
    assert!(store.ttl(BALLOT).is_none());
}

#[tokio::test]
async fn test_start_without_participants_stays_start() {
    let Setup {
        store, mut client, ..
    } = setup().await;

    let reply = vote(&mut client, "T1", "@", Some("go")).await;
    assert_eq!(status(&reply), "ok");
    assert!(body(&reply).is_empty());
    assert_eq!(fields(&store)["*"], "start");
}

#[tokio::test]
async fn test_read_never_mutates() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let _w1 = participant(&fabric, "w1").await;

    let absent = vote(&mut client, "T1", "$", None).await;
    assert_eq!(status(&absent), "error");
    assert!(!store.exists(BALLOT).unwrap());

    vote(&mut client, "T1", "@", Some("go")).await;
    let before = fields(&store);
    let first = vote(&mut client, "T1", "$", None).await;
    let second = vote(&mut client, "T1", "$", None).await;
    assert_eq!(fields(&store), before);
    assert_eq!(status(&first), "sent");
    assert_eq!(body(&first), body(&second));
    assert!(!body(&first).contains_key("*"));
}

#[tokio::test]
async fn test_list_participants() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let _b = participant(&fabric, "beta").await;
    let _a = participant(&fabric, "alpha").await;

    let reply = vote(&mut client, "T1", "*", None).await;
    assert_eq!(text(&reply, FrameType::Command), "&");
    let names: Vec<String> = serde_json::from_str(&text(&reply, FrameType::Content)).unwrap();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    assert!(!store.exists(BALLOT).unwrap());
}

#[tokio::test]
async fn test_re_push_only_touches_pending_participants() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let mut w1 = participant(&fabric, "w1").await;
    let mut w2 = participant(&fabric, "w2").await;
    let mut w3 = participant(&fabric, "w3").await;

    assert_eq!(status(&vote(&mut client, "T1", "@", Some("go")).await), "ok");
    for socket in [&mut w1, &mut w2, &mut w3] {
        recv_env(socket).await;
    }
    store.set_field(BALLOT, "w1", "yes").unwrap();
    store.set_field(BALLOT, "w2", "error").unwrap();

    let mut other = dealer(&fabric, VOTE_PORT, "client-2").await;
    other
        .send(request(
            Command::Extension(VOTE_REPUSH),
            &[(FrameType::RequestId, "T1")],
            KEY,
        ))
        .await
        .unwrap();
    let reply = recv_env(&mut other).await;
    assert_eq!(text(&reply, FrameType::Command), "+");
    assert_eq!(status(&reply), "ok");

    let again = recv_env(&mut w3).await;
    assert_eq!(text(&again, FrameType::Argument), "go");
    assert_silent(&mut w1).await;
    assert_silent(&mut w2).await;

    let stored = fields(&store);
    assert_eq!(stored["w1"], "yes");
    assert_eq!(stored["w2"], "error");
    assert_eq!(stored["w3"], "-sent");
    assert_eq!(stored["@"], "client-2");
}

#[tokio::test]
async fn test_failed_re_push_stays_pending() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;
    let mut w1 = participant(&fabric, "w1").await;

    assert_eq!(status(&vote(&mut client, "T1", "@", Some("go")).await), "ok");
    recv_env(&mut w1).await;
    drop(w1);

    assert_eq!(status(&re_push(&mut client, "T1").await), "send_error");
    assert_eq!(fields(&store)["w1"], "-sent");

    // back under the same identity, the next re-push delivers
    let mut w1 = participant(&fabric, "w1").await;
    assert_eq!(status(&re_push(&mut client, "T1").await), "ok");
    let again = recv_env(&mut w1).await;
    assert_eq!(text(&again, FrameType::RequestId), "T1");
    assert_eq!(text(&again, FrameType::Argument), "go");
    assert_eq!(fields(&store)["w1"], "-sent");
}

#[tokio::test]
async fn test_re_push_of_missing_ballot() {
    let Setup { fabric, .. } = setup().await;
    let mut other = dealer(&fabric, VOTE_PORT, "client-2").await;
    other
        .send(request(
            Command::Extension(VOTE_REPUSH),
            &[(FrameType::RequestId, "nope")],
            KEY,
        ))
        .await
        .unwrap();
    assert_eq!(status(&recv_env(&mut other).await), "error");
}

#[tokio::test]
async fn test_store_failure_replies_error() {
    let Setup {
        fabric,
        store,
        mut client,
    } = setup().await;

    store.set_offline(true);
    let reply = vote(&mut client, "T1", "$", None).await;
    assert_eq!(status(&reply), "error");
    assert_eq!(fabric.directory.counters("ballot").unwrap().request_err, 1);

    store.set_offline(false);
    assert_eq!(status(&vote(&mut client, "T1", "$", None).await), "error");
}
