//! TCP socket backend
//!
//! Wire format per message: big-endian `u32` frame count, then every frame as a
//! big-endian `u32` length followed by its bytes. A connecting peer first
//! sends a one-frame greeting with its routing identity; an empty identity
//! makes the bound side assign one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::{identity_label, random_identity, Endpoint, FrameSocket, SocketKind, QUEUE_DEPTH};
use crate::error::TransportError;

/// Largest accepted frame
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Largest accepted frame count per message
const MAX_FRAMES: u32 = 1024;

/// Write one message
pub async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(4 + frames.iter().map(|f| f.len() + 4).sum::<usize>());
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32().await?;
    if count > MAX_FRAMES {
        return Err(TransportError::Malformed(format!("{} frames", count)));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Malformed(format!("frame of {} bytes", len)));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }
    Ok(frames)
}

/// Outbound queue per identity, tagged with the connection that owns it
type PeerTable = Arc<Mutex<HashMap<Bytes, (u64, mpsc::Sender<Vec<Bytes>>)>>>;

enum Side {
    Bound {
        peers: PeerTable,
        accept_task: JoinHandle<()>,
    },
    Connected {
        writer: OwnedWriteHalf,
        reader_task: JoinHandle<()>,
    },
}

/// Socket over TCP
pub struct TcpSocket {
    kind: SocketKind,
    endpoint: Endpoint,
    side: Side,
    rx: mpsc::Receiver<Vec<Bytes>>,
    closed: bool,
}

impl TcpSocket {
    pub async fn bind(kind: SocketKind, endpoint: Endpoint) -> Result<Self, TransportError> {
        let addr = socket_addr(&endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::Bind {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        debug!("tcp: bound {} socket on {}", kind.as_str(), endpoint);

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, kind, peers.clone(), tx));

        Ok(Self {
            kind,
            endpoint,
            side: Side::Bound { peers, accept_task },
            rx,
            closed: false,
        })
    }

    pub async fn connect(
        kind: SocketKind,
        endpoint: Endpoint,
        identity: Bytes,
    ) -> Result<Self, TransportError> {
        let addr = socket_addr(&endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        write_message(&mut writer, &[identity.clone()]).await?;
        debug!(
            "tcp: {} socket {} connected to {}",
            kind.as_str(),
            identity_label(&identity),
            endpoint
        );

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(frames) => {
                        if tx.send(frames).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tcp: connection closed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            kind,
            endpoint,
            side: Side::Connected {
                writer,
                reader_task,
            },
            rx,
            closed: false,
        })
    }
}

fn socket_addr(endpoint: &Endpoint) -> Result<String, TransportError> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok(format!("{}:{}", host, port)),
        Endpoint::Inproc(_) => Err(TransportError::Malformed(format!(
            "{} is not a tcp endpoint",
            endpoint
        ))),
    }
}

/// Accept peers until aborted
///
/// Connection tasks live in a `JoinSet` owned by this future, so aborting the
/// accept task also tears down every open connection.
async fn accept_loop(
    listener: TcpListener,
    kind: SocketKind,
    peers: PeerTable,
    inbox: mpsc::Sender<Vec<Bytes>>,
) {
    let mut connections = JoinSet::new();
    let mut next_conn = 0u64;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("tcp: accept failed: {}", e);
                continue;
            }
        };
        next_conn += 1;
        let conn = next_conn;
        connections.spawn(serve_peer(stream, addr, conn, kind, peers.clone(), inbox.clone()));
    }
}

/// One accepted connection: greeting, then reads and writes until either
/// side stops
async fn serve_peer(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    conn: u64,
    kind: SocketKind,
    peers: PeerTable,
    inbox: mpsc::Sender<Vec<Bytes>>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let identity = match read_message(&mut reader).await {
        Ok(greeting) => greeting
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(random_identity),
        Err(e) => {
            debug!("tcp: {} sent no greeting: {}", addr, e);
            return;
        }
    };
    debug!("tcp: peer {} from {}", identity_label(&identity), addr);

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<Bytes>>(QUEUE_DEPTH);
    peers.lock().insert(identity.clone(), (conn, out_tx));

    let writing = async {
        while let Some(frames) = out_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &frames).await {
                debug!("tcp: write failed: {}", e);
                break;
            }
        }
    };
    let reading = async {
        while let Ok(frames) = read_message(&mut reader).await {
            if kind == SocketKind::Pub {
                continue;
            }
            let mut message = Vec::with_capacity(frames.len() + 1);
            message.push(identity.clone());
            message.extend(frames);
            if inbox.send(message).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = writing => {}
        _ = reading => {}
    }

    {
        let mut peers = peers.lock();
        if peers.get(&identity).map(|(c, _)| *c == conn).unwrap_or(false) {
            peers.remove(&identity);
        }
    }
    debug!("tcp: peer {} disconnected", identity_label(&identity));
}

fn try_deliver(
    tx: &mpsc::Sender<Vec<Bytes>>,
    frames: Vec<Bytes>,
    peer: &Bytes,
) -> Result<(), TransportError> {
    tx.try_send(frames).map_err(|e| match e {
        TrySendError::Full(_) => TransportError::WouldBlock,
        TrySendError::Closed(_) => TransportError::Unroutable(identity_label(peer)),
    })
}

#[async_trait]
impl FrameSocket for TcpSocket {
    async fn send(&mut self, mut frames: Vec<Bytes>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match (&mut self.side, self.kind) {
            (Side::Bound { peers, .. }, SocketKind::Router) => {
                if frames.is_empty() {
                    return Err(TransportError::Malformed("missing peer identity".into()));
                }
                let peer = frames.remove(0);
                let tx = peers
                    .lock()
                    .get(&peer)
                    .map(|(_, tx)| tx.clone())
                    .ok_or_else(|| TransportError::Unroutable(identity_label(&peer)))?;
                try_deliver(&tx, frames, &peer)
            }
            (Side::Bound { peers, .. }, SocketKind::Pub) => {
                let subscribers: Vec<_> = peers.lock().values().map(|(_, tx)| tx.clone()).collect();
                for tx in subscribers {
                    let _ = tx.try_send(frames.clone());
                }
                Ok(())
            }
            (Side::Connected { writer, .. }, SocketKind::Dealer | SocketKind::Req) => {
                if self.kind == SocketKind::Req {
                    frames.insert(0, Bytes::new());
                }
                write_message(writer, &frames).await
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
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.side {
            Side::Bound { peers, accept_task } => {
                accept_task.abort();
                peers.lock().clear();
            }
            Side::Connected {
                writer,
                reader_task,
            } => {
                reader_task.abort();
                let _ = writer.shutdown().await;
            }
        }
        self.rx.close();
        debug!("tcp: closed {} socket on {}", self.kind.as_str(), self.endpoint);
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        match &self.side {
            Side::Bound { accept_task, .. } => accept_task.abort(),
            Side::Connected { reader_task, .. } => reader_task.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_codec() {
        let frames = vec![
            Bytes::from_static(b"a"),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        ];
        let mut buf = Vec::new();
        write_message(&mut buf, &frames).await.unwrap();
        assert_eq!(&buf[..4], &3u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).await.unwrap(), frames);
    }

    #[tokio::test]
    async fn test_oversized_count_rejected() {
        let mut cursor = std::io::Cursor::new((MAX_FRAMES + 1).to_be_bytes().to_vec());
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(TransportError::Malformed(_))
        ));
    }

    fn free_endpoint() -> Endpoint {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::tcp("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_router_dealer_over_loopback() {
        let ep = free_endpoint();
        let mut router = TcpSocket::bind(SocketKind::Router, ep.clone()).await.unwrap();
        let mut dealer = TcpSocket::connect(SocketKind::Dealer, ep, Bytes::from_static(b"w1"))
            .await
            .unwrap();

        dealer.send(vec![Bytes::from_static(b"hi")]).await.unwrap();
        let got = router.recv().await.unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"w1"), Bytes::from_static(b"hi")]);

        router
            .send(vec![Bytes::from_static(b"w1"), Bytes::from_static(b"yo")])
            .await
            .unwrap();
        assert_eq!(dealer.recv().await.unwrap(), vec![Bytes::from_static(b"yo")]);

        let err = router
            .send(vec![Bytes::from_static(b"ghost"), Bytes::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unroutable(_)));
    }

    #[tokio::test]
    async fn test_reconnect_under_same_identity_stays_routable() {
        let ep = free_endpoint();
        let mut router = TcpSocket::bind(SocketKind::Router, ep.clone()).await.unwrap();
        let w1 = Bytes::from_static(b"w1");

        let mut old = TcpSocket::connect(SocketKind::Dealer, ep.clone(), w1.clone())
            .await
            .unwrap();
        old.send(vec![Bytes::from_static(b"a")]).await.unwrap();
        assert_eq!(router.recv().await.unwrap()[1], Bytes::from_static(b"a"));

        let mut new = TcpSocket::connect(SocketKind::Dealer, ep, w1.clone())
            .await
            .unwrap();
        new.send(vec![Bytes::from_static(b"b")]).await.unwrap();
        assert_eq!(router.recv().await.unwrap()[1], Bytes::from_static(b"b"));

        old.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        router
            .send(vec![w1, Bytes::from_static(b"job")])
            .await
            .unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), new.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"job")]);
    }

    #[tokio::test]
    async fn test_closing_router_drops_connections() {
        let ep = free_endpoint();
        let mut router = TcpSocket::bind(SocketKind::Router, ep.clone()).await.unwrap();
        let mut dealer = TcpSocket::connect(SocketKind::Dealer, ep, Bytes::from_static(b"c"))
            .await
            .unwrap();
        dealer.send(vec![Bytes::from_static(b"hi")]).await.unwrap();
        router.recv().await.unwrap();

        router.close().await;
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), dealer.recv()).await;
        assert!(matches!(got, Ok(Err(TransportError::Closed))));
    }
}
