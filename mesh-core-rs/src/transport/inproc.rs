//! In-process socket backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::{identity_label, Endpoint, FrameSocket, SocketKind, QUEUE_DEPTH};
use crate::error::TransportError;

type Registration = (u64, mpsc::Sender<Vec<Bytes>>);

/// Every registration carries the connection id of its socket, so a socket
/// going away never removes its successor under the same identity.
#[derive(Default)]
struct Slot {
    /// Inbox of the bound socket, messages are `[identity, frames ...]`
    inbox: Option<Registration>,
    /// Connected sockets by identity
    peers: HashMap<Bytes, Registration>,
}

impl Slot {
    fn is_unused(&self) -> bool {
        self.inbox.is_none() && self.peers.is_empty()
    }
}

/// Registry of in-process endpoints
///
/// Connecting to an endpoint that is not bound yet succeeds; sends fail with
/// `Unroutable` until a socket binds it.
#[derive(Default)]
pub struct InprocHub {
    slots: Mutex<HashMap<String, Slot>>,
    next_conn: AtomicU64,
}

impl InprocHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some socket currently owns `endpoint`
    pub fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.slots
            .lock()
            .get(&endpoint.to_string())
            .map(|s| s.inbox.is_some())
            .unwrap_or(false)
    }

    /// Number of peers connected to `endpoint`
    pub fn peer_count(&self, endpoint: &Endpoint) -> usize {
        self.slots
            .lock()
            .get(&endpoint.to_string())
            .map(|s| s.peers.len())
            .unwrap_or(0)
    }

    fn conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn bind(
        self: &Arc<Self>,
        kind: SocketKind,
        endpoint: Endpoint,
    ) -> Result<InprocSocket, TransportError> {
        let key = endpoint.to_string();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let conn = self.conn_id();
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key).or_default();
            if slot.inbox.as_ref().map(|(_, s)| !s.is_closed()).unwrap_or(false) {
                return Err(TransportError::Bind {
                    endpoint: endpoint.to_string(),
                    reason: "address in use".to_string(),
                });
            }
            slot.inbox = Some((conn, tx));
        }
        debug!("inproc: bound {} socket on {}", kind.as_str(), endpoint);
        Ok(InprocSocket {
            hub: self.clone(),
            conn,
            kind,
            endpoint,
            identity: None,
            rx,
            closed: false,
        })
    }

    pub(crate) fn connect(
        self: &Arc<Self>,
        kind: SocketKind,
        endpoint: Endpoint,
        identity: Bytes,
    ) -> InprocSocket {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let conn = self.conn_id();
        self.slots
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .peers
            .insert(identity.clone(), (conn, tx));
        debug!(
            "inproc: {} socket {} connected to {}",
            kind.as_str(),
            identity_label(&identity),
            endpoint
        );
        InprocSocket {
            hub: self.clone(),
            conn,
            kind,
            endpoint,
            identity: Some(identity),
            rx,
            closed: false,
        }
    }

    fn release(&self, endpoint: &Endpoint, identity: Option<&Bytes>, conn: u64) {
        let key = endpoint.to_string();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            match identity {
                Some(id) => {
                    if slot.peers.get(id).map(|(c, _)| *c == conn).unwrap_or(false) {
                        slot.peers.remove(id);
                    }
                }
                None => {
                    if slot.inbox.as_ref().map(|(c, _)| *c == conn).unwrap_or(false) {
                        slot.inbox = None;
                    }
                }
            }
            if slot.is_unused() {
                slots.remove(&key);
            }
        }
    }

    fn to_bound(&self, endpoint: &Endpoint, message: Vec<Bytes>) -> Result<(), TransportError> {
        let inbox = self
            .slots
            .lock()
            .get(&endpoint.to_string())
            .and_then(|s| s.inbox.as_ref().map(|(_, tx)| tx.clone()))
            .ok_or_else(|| TransportError::Unroutable(endpoint.to_string()))?;
        deliver(&inbox, message, || endpoint.to_string())
    }

    fn to_peer(
        &self,
        endpoint: &Endpoint,
        identity: &Bytes,
        message: Vec<Bytes>,
    ) -> Result<(), TransportError> {
        let peer = self
            .slots
            .lock()
            .get(&endpoint.to_string())
            .and_then(|s| s.peers.get(identity).map(|(_, tx)| tx.clone()))
            .ok_or_else(|| TransportError::Unroutable(identity_label(identity)))?;
        deliver(&peer, message, || identity_label(identity))
    }

    fn to_all_peers(&self, endpoint: &Endpoint, message: Vec<Bytes>) {
        let peers: Vec<_> = self
            .slots
            .lock()
            .get(&endpoint.to_string())
            .map(|s| s.peers.values().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        for peer in peers {
            // Slow subscribers lose messages
            let _ = peer.try_send(message.clone());
        }
    }
}

fn deliver(
    tx: &mpsc::Sender<Vec<Bytes>>,
    message: Vec<Bytes>,
    label: impl FnOnce() -> String,
) -> Result<(), TransportError> {
    tx.try_send(message).map_err(|e| match e {
        TrySendError::Full(_) => TransportError::WouldBlock,
        TrySendError::Closed(_) => TransportError::Unroutable(label()),
    })
}

/// Socket on an [`InprocHub`] endpoint
pub struct InprocSocket {
    hub: Arc<InprocHub>,
    conn: u64,
    kind: SocketKind,
    endpoint: Endpoint,
    /// Own identity for connected sockets, `None` for the bound side
    identity: Option<Bytes>,
    rx: mpsc::Receiver<Vec<Bytes>>,
    closed: bool,
}

#[async_trait]
impl FrameSocket for InprocSocket {
    async fn send(&mut self, mut frames: Vec<Bytes>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match (self.kind, &self.identity) {
            (SocketKind::Router, None) => {
                if frames.is_empty() {
                    return Err(TransportError::Malformed("missing peer identity".into()));
                }
                let peer = frames.remove(0);
                self.hub.to_peer(&self.endpoint, &peer, frames)
            }
            (SocketKind::Pub, None) => {
                self.hub.to_all_peers(&self.endpoint, frames);
                Ok(())
            }
            (SocketKind::Dealer, Some(id)) | (SocketKind::Req, Some(id)) => {
                let mut message = Vec::with_capacity(frames.len() + 2);
                message.push(id.clone());
                if self.kind == SocketKind::Req {
                    message.push(Bytes::new());
                }
                message.extend(frames);
                self.hub.to_bound(&self.endpoint, message)
            }
            _ => Err(TransportError::Unsupported(self.kind.as_str())),
        }
    }

    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.kind == SocketKind::Pub {
            return Err(TransportError::Unsupported(self.kind.as_str()));
        }
        let mut message = self.rx.recv().await.ok_or(TransportError::Closed)?;
        if self.kind == SocketKind::Req && message.first().map(|f| f.is_empty()).unwrap_or(false) {
            message.remove(0);
        }
        Ok(message)
    }

    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.hub.release(&self.endpoint, self.identity.as_ref(), self.conn);
            self.rx.close();
        }
    }
}

impl Drop for InprocSocket {
    fn drop(&mut self) {
        if !self.closed {
            self.hub.release(&self.endpoint, self.identity.as_ref(), self.conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_router_dealer_round_trip() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("svc");
        let mut router = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        let mut dealer = hub.connect(SocketKind::Dealer, ep.clone(), b("w1"));

        dealer.send(vec![b("hello")]).await.unwrap();
        let got = router.recv().await.unwrap();
        assert_eq!(got, vec![b("w1"), b("hello")]);

        router.send(vec![b("w1"), b("back")]).await.unwrap();
        assert_eq!(dealer.recv().await.unwrap(), vec![b("back")]);
    }

    #[tokio::test]
    async fn test_req_adds_and_strips_delimiter() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("plan_dispatcher");
        let mut router = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        let mut req = hub.connect(SocketKind::Req, ep.clone(), b("s1"));

        req.send(vec![b("desc")]).await.unwrap();
        let got = router.recv().await.unwrap();
        assert_eq!(got, vec![b("s1"), Bytes::new(), b("desc")]);

        router
            .send(vec![b("s1"), Bytes::new(), b("reply")])
            .await
            .unwrap();
        assert_eq!(req.recv().await.unwrap(), vec![b("reply")]);
    }

    #[tokio::test]
    async fn test_router_unknown_peer_is_unroutable() {
        let hub = Arc::new(InprocHub::new());
        let mut router = hub
            .bind(SocketKind::Router, Endpoint::inproc("r"))
            .unwrap();
        let err = router.send(vec![b("ghost"), b("x")]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unroutable(_)));
    }

    #[tokio::test]
    async fn test_send_before_bind_fails() {
        let hub = Arc::new(InprocHub::new());
        let mut req = hub.connect(SocketKind::Req, Endpoint::inproc("later"), b("a"));
        assert!(matches!(
            req.send(vec![b("x")]).await,
            Err(TransportError::Unroutable(_))
        ));
    }

    #[tokio::test]
    async fn test_double_bind_rejected_until_closed() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("dup");
        let mut first = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        assert!(matches!(
            hub.bind(SocketKind::Router, ep.clone()),
            Err(TransportError::Bind { .. })
        ));
        first.close().await;
        assert!(!hub.is_bound(&ep));
        assert!(hub.bind(SocketKind::Router, ep).is_ok());
    }

    #[tokio::test]
    async fn test_pub_reaches_all_subscribers() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::tcp("127.0.0.1", 7001);
        let mut publisher = hub.bind(SocketKind::Pub, ep.clone()).unwrap();
        let mut s1 = hub.connect(SocketKind::Sub, ep.clone(), b("s1"));
        let mut s2 = hub.connect(SocketKind::Sub, ep.clone(), b("s2"));

        publisher.send(vec![b("news")]).await.unwrap();
        assert_eq!(s1.recv().await.unwrap(), vec![b("news")]);
        assert_eq!(s2.recv().await.unwrap(), vec![b("news")]);
        assert!(publisher.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_survives_old_socket_closing() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("svc");
        let mut router = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        let mut old = hub.connect(SocketKind::Dealer, ep.clone(), b("w1"));
        let mut new = hub.connect(SocketKind::Dealer, ep.clone(), b("w1"));

        old.close().await;
        assert_eq!(hub.peer_count(&ep), 1);
        router.send(vec![b("w1"), b("job")]).await.unwrap();
        assert_eq!(new.recv().await.unwrap(), vec![b("job")]);
    }

    #[tokio::test]
    async fn test_stale_bound_socket_keeps_successor() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("svc");
        let mut first = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        first.rx.close();
        let mut second = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        drop(first);
        assert!(hub.is_bound(&ep));

        let mut dealer = hub.connect(SocketKind::Dealer, ep, b("c"));
        dealer.send(vec![b("hi")]).await.unwrap();
        assert_eq!(second.recv().await.unwrap(), vec![b("c"), b("hi")]);
    }

    #[tokio::test]
    async fn test_dropped_peer_is_released() {
        let hub = Arc::new(InprocHub::new());
        let ep = Endpoint::inproc("svc");
        let _router = hub.bind(SocketKind::Router, ep.clone()).unwrap();
        {
            let _dealer = hub.connect(SocketKind::Dealer, ep.clone(), b("w1"));
            assert_eq!(hub.peer_count(&ep), 1);
        }
        assert_eq!(hub.peer_count(&ep), 0);
    }
}
