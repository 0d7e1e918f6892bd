//! Multi-frame socket transport
//!
//! Stations talk through [`FrameSocket`]s with ROUTER/DEALER/REQ/PUB/SUB
//! semantics. Two backends exist:
//!
//! - [`inproc`]: in-process endpoints routed through a shared [`InprocHub`]
//! - [`tcp`]: length-prefixed frames over tokio TCP streams
//!
//! A [`SocketFactory`] hands out sockets for either backend. The in-memory
//! factory maps `tcp://` endpoints into the hub as well, which is what the
//! integration tests use.
//!
//! Every `recv` is backed by an mpsc channel, so dropping a pending receive
//! never loses a message.

pub mod inproc;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub use inproc::InprocHub;

/// Per-socket inbound queue depth
pub const QUEUE_DEPTH: usize = 1024;

/// Socket pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Bound; prefixes received messages with the peer identity and routes
    /// sends by their first frame. Unknown peers are an error.
    Router,
    /// Connected; frames pass through untouched
    Dealer,
    /// Connected; adds the empty delimiter on send and strips it on receive
    Req,
    /// Bound; sends go to every subscriber, receiving is not supported
    Pub,
    /// Connected; receives everything the publisher sends
    Sub,
}

impl SocketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketKind::Router => "router",
            SocketKind::Dealer => "dealer",
            SocketKind::Req => "req",
            SocketKind::Pub => "pub",
            SocketKind::Sub => "sub",
        }
    }

    /// Whether this kind owns an endpoint rather than connecting to one
    pub fn binds(self) -> bool {
        matches!(self, SocketKind::Router | SocketKind::Pub)
    }
}

/// Socket address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Inproc(String),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn inproc(name: impl Into<String>) -> Self {
        Endpoint::Inproc(name.into())
    }

    /// Parse `tcp://host:port` or `inproc://name`
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(TransportError::Malformed(format!("empty endpoint: {}", s)));
            }
            return Ok(Endpoint::inproc(name));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| TransportError::Malformed(format!("missing port: {}", s)))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::Malformed(format!("bad port: {}", s)))?;
            return Ok(Endpoint::tcp(host, port));
        }
        Err(TransportError::Malformed(format!("unknown scheme: {}", s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

/// A duplex multi-frame socket
#[async_trait]
pub trait FrameSocket: Send {
    /// Send one message; Router sockets take the peer identity as frame 0
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError>;

    /// Receive one message; Router sockets yield the peer identity as frame 0
    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError>;

    fn kind(&self) -> SocketKind;

    fn endpoint(&self) -> &Endpoint;

    /// Release the endpoint; further calls fail with `Closed`
    async fn close(&mut self);
}

/// Creates sockets for stations
#[derive(Clone)]
pub struct SocketFactory {
    hub: Arc<InprocHub>,
    tcp_in_memory: bool,
}

impl SocketFactory {
    /// Real TCP for `tcp://`, the hub for `inproc://`
    pub fn new(hub: Arc<InprocHub>) -> Self {
        Self {
            hub,
            tcp_in_memory: false,
        }
    }

    /// Everything through the hub
    pub fn in_memory(hub: Arc<InprocHub>) -> Self {
        Self {
            hub,
            tcp_in_memory: true,
        }
    }

    pub fn hub(&self) -> &Arc<InprocHub> {
        &self.hub
    }

    pub async fn bind(
        &self,
        kind: SocketKind,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn FrameSocket>, TransportError> {
        if !kind.binds() {
            return Err(TransportError::Unsupported(kind.as_str()));
        }
        match endpoint {
            Endpoint::Tcp { .. } if !self.tcp_in_memory => {
                Ok(Box::new(tcp::TcpSocket::bind(kind, endpoint.clone()).await?))
            }
            _ => Ok(Box::new(self.hub.bind(kind, endpoint.clone())?)),
        }
    }

    pub async fn connect(
        &self,
        kind: SocketKind,
        endpoint: &Endpoint,
        identity: Option<Bytes>,
    ) -> Result<Box<dyn FrameSocket>, TransportError> {
        if kind.binds() {
            return Err(TransportError::Unsupported(kind.as_str()));
        }
        let identity = identity.unwrap_or_else(random_identity);
        match endpoint {
            Endpoint::Tcp { .. } if !self.tcp_in_memory => Ok(Box::new(
                tcp::TcpSocket::connect(kind, endpoint.clone(), identity).await?,
            )),
            _ => Ok(Box::new(self.hub.connect(kind, endpoint.clone(), identity))),
        }
    }
}

/// Identity for peers that did not pick one
pub fn random_identity() -> Bytes {
    Bytes::from(uuid::Uuid::new_v4().simple().to_string())
}

/// Printable form of a routing identity
pub fn identity_label(identity: &[u8]) -> String {
    String::from_utf8_lossy(identity).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5555").unwrap(),
            Endpoint::tcp("127.0.0.1", 5555)
        );
        assert_eq!(
            Endpoint::parse("inproc://plan_dispatcher").unwrap(),
            Endpoint::inproc("plan_dispatcher")
        );
        assert!(Endpoint::parse("tcp://nohost").is_err());
        assert!(Endpoint::parse("udp://x:1").is_err());
        assert!(Endpoint::parse("inproc://").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::tcp("0.0.0.0", 80).to_string(), "tcp://0.0.0.0:80");
        assert_eq!(Endpoint::inproc("vote").to_string(), "inproc://vote");
    }

    #[tokio::test]
    async fn test_factory_rejects_wrong_direction() {
        let factory = SocketFactory::in_memory(Arc::new(InprocHub::new()));
        let ep = Endpoint::inproc("x");
        assert!(factory.bind(SocketKind::Dealer, &ep).await.is_err());
        assert!(factory.connect(SocketKind::Router, &ep, None).await.is_err());
    }
}
