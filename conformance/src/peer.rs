//! Synthetic peers.
//!
//! A [`SyntheticPeer`] is one simulated network participant: it binds to a
//! leased pool address, dials the target, runs the handshake and then
//! exchanges framed messages. A background reader task owns the read half of
//! the socket and forwards decoded messages over a channel, so [`recv`] can be
//! raced against a timeout without losing data.
//!
//! [`recv`]: SyntheticPeer::recv

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ledger_protocol::handshake::{
    HandshakeCfg, HandshakeError, HandshakeRequest, HandshakeResponse, MAX_HEADER_BLOCK, NodeKey,
    head_len, network_time_now, shared_value,
};
use ledger_protocol::{Codec, MalformedMessage, ProtocolMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::pool::AddressLease;

/// Default timeout for receiving a message.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on the whole handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest rejection body read after a non-101 response.
const MAX_REJECTION_BODY: usize = 64 * 1024;

const INBOX_CAPACITY: usize = 1024;

/// Connection lifecycle of a synthetic peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Connection setup failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake not finished within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake rejected with {status} {reason}")]
    Rejected {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("invalid handshake response: {0}")]
    InvalidResponse(HandshakeError),

    #[error("invalid handshake request: {0}")]
    InvalidRequest(HandshakeError),

    #[error("peer is already {0:?}")]
    InvalidState(PeerState),
}

/// Receive failures.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("no message within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by remote")]
    Disconnected,

    #[error("remote sent a malformed frame: {0}")]
    Malformed(MalformedMessage),

    #[error("peer is not connected")]
    NotConnected,
}

/// What a test hands to [`SyntheticPeer::send`].
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded with the peer's codec.
    Message(ProtocolMessage),
    /// Written to the socket unchanged.
    Bytes(Bytes),
}

impl From<ProtocolMessage> for Outbound {
    fn from(msg: ProtocolMessage) -> Self {
        Self::Message(msg)
    }
}

impl From<Bytes> for Outbound {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for Outbound {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

/// Synthetic peer settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// `None` connects without a handshake (raw TCP).
    pub handshake: Option<HandshakeCfg>,
    pub handshake_timeout: Duration,
    /// Answer target pings from the reader task.
    pub auto_pong: bool,
    /// Identity; a fresh key is generated when unset.
    pub node_key: Option<NodeKey>,
    pub codec: Codec,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            handshake: Some(HandshakeCfg::default()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            auto_pong: true,
            node_key: None,
            codec: Codec::new(),
        }
    }
}

impl PeerConfig {
    /// Raw TCP, no handshake.
    pub fn without_handshake() -> Self {
        Self {
            handshake: None,
            ..Self::default()
        }
    }

    pub fn with_handshake(handshake: HandshakeCfg) -> Self {
        Self {
            handshake: Some(handshake),
            ..Self::default()
        }
    }
}

enum Inbound {
    Message(ProtocolMessage),
    Malformed(MalformedMessage),
    Closed,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

struct Connection {
    local: SocketAddr,
    remote: SocketAddr,
    writer: SharedWriter,
    inbox: mpsc::Receiver<Inbound>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// A simulated network participant.
pub struct SyntheticPeer {
    lease: Arc<AddressLease>,
    config: PeerConfig,
    key: NodeKey,
    state: PeerState,
    conn: Option<Connection>,
}

impl fmt::Debug for SyntheticPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticPeer")
            .field("addr", &self.lease.addr())
            .field("state", &self.state)
            .field("local", &self.conn.as_ref().map(|c| c.local))
            .finish()
    }
}

impl SyntheticPeer {
    pub fn new(lease: AddressLease, config: PeerConfig) -> Self {
        Self::from_shared_lease(Arc::new(lease), config)
    }

    fn from_shared_lease(lease: Arc<AddressLease>, config: PeerConfig) -> Self {
        let key = config.node_key.clone().unwrap_or_else(NodeKey::generate);
        Self {
            lease,
            config,
            key,
            state: PeerState::Disconnected,
            conn: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Leased source address.
    pub fn addr(&self) -> std::net::IpAddr {
        self.lease.addr()
    }

    /// Bound socket address once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|c| c.local)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|c| c.remote)
    }

    pub fn node_key(&self) -> &NodeKey {
        &self.key
    }

    /// Ready and the remote has not closed the connection.
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Ready
            && self
                .conn
                .as_ref()
                .is_some_and(|c| c.open.load(Ordering::Acquire))
    }

    /// Dial `target` from the leased address and run the handshake.
    pub async fn connect(&mut self, target: SocketAddr) -> Result<(), ConnectError> {
        if self.state != PeerState::Disconnected {
            return Err(ConnectError::InvalidState(self.state));
        }

        self.state = PeerState::Connecting;
        let result = self.dial(target).await;
        if result.is_err() {
            self.state = PeerState::Closed;
        }
        result
    }

    async fn dial(&mut self, target: SocketAddr) -> Result<(), ConnectError> {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(self.lease.addr(), 0))?;

        // One budget covers both the TCP connect and the upgrade exchange.
        let timeout = self.config.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let stream = tokio::time::timeout_at(deadline, socket.connect(target))
            .await
            .map_err(|_| ConnectError::HandshakeTimeout(timeout))??;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        debug!(%local, %target, "connected");

        let (mut read, mut write) = stream.into_split();
        let leftover = match self.config.handshake.clone() {
            Some(cfg) => {
                self.state = PeerState::Handshaking;
                let shared = shared_value(local, target);
                let request = HandshakeRequest::build(&cfg, &self.key, &shared);
                tokio::time::timeout_at(
                    deadline,
                    initiate(&mut read, &mut write, &request, &shared),
                )
                .await
                .map_err(|_| ConnectError::HandshakeTimeout(timeout))??
            }
            None => BytesMut::new(),
        };

        self.start(local, target, read, write, leftover);
        Ok(())
    }

    fn start(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
        leftover: BytesMut,
    ) {
        let writer = Arc::new(Mutex::new(write));
        let open = Arc::new(AtomicBool::new(true));
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);

        let reader = tokio::spawn(read_loop(
            read,
            leftover,
            tx,
            self.config.codec,
            self.config.auto_pong.then(|| Arc::clone(&writer)),
            Arc::clone(&open),
        ));

        self.conn = Some(Connection {
            local,
            remote,
            writer,
            inbox,
            open,
            reader,
        });
        self.state = PeerState::Ready;
    }

    /// Send a message or raw bytes.
    pub async fn send(&self, out: impl Into<Outbound>) -> io::Result<()> {
        let conn = match (&self.conn, self.state) {
            (Some(conn), PeerState::Ready) => conn,
            _ => return Err(io::ErrorKind::NotConnected.into()),
        };
        let bytes = match out.into() {
            Outbound::Message(msg) => {
                trace!(kind = msg.kind(), "send");
                self.config
                    .codec
                    .encode(&msg)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            }
            Outbound::Bytes(raw) => {
                trace!(len = raw.len(), "send raw");
                raw
            }
        };
        let mut writer = conn.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await
    }

    /// Next message from the remote.
    pub async fn recv(&mut self, timeout: Duration) -> Result<ProtocolMessage, RecvError> {
        if self.state != PeerState::Ready {
            return Err(RecvError::NotConnected);
        }
        let conn = self.conn.as_mut().ok_or(RecvError::NotConnected)?;
        match tokio::time::timeout(timeout, conn.inbox.recv()).await {
            Err(_) => Err(RecvError::Timeout(timeout)),
            Ok(Some(Inbound::Message(msg))) => Ok(msg),
            Ok(Some(Inbound::Malformed(err))) => {
                self.state = PeerState::Closed;
                Err(RecvError::Malformed(err))
            }
            Ok(Some(Inbound::Closed)) | Ok(None) => {
                self.state = PeerState::Closed;
                Err(RecvError::Disconnected)
            }
        }
    }

    /// Consume messages until one matches `pred`. False on timeout or close.
    pub async fn expect_message(
        &mut self,
        mut pred: impl FnMut(&ProtocolMessage) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.recv(left).await {
                Ok(msg) if pred(&msg) => return true,
                Ok(msg) => trace!(kind = msg.kind(), "skipping"),
                Err(_) => return false,
            }
        }
    }

    /// Drain messages until the remote closes. False if it is still open at the deadline.
    pub async fn expect_disconnect(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.recv(left).await {
                Ok(_) => continue,
                Err(RecvError::Timeout(_)) => return false,
                Err(_) => return true,
            }
        }
    }

    /// Tear down the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
            debug!(local = %conn.local, "closed");
        }
        self.state = PeerState::Closed;
    }
}

impl Drop for SyntheticPeer {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
        }
    }
}

// =============================================================================
// Handshake I/O
// =============================================================================

/// Read an HTTP head from `read` into `buf`, returning its length.
///
/// Bytes past the head stay in `buf`.
pub async fn read_head<R: AsyncRead + Unpin>(
    read: &mut R,
    buf: &mut BytesMut,
) -> Result<usize, HandshakeReadError> {
    loop {
        if let Some(len) = head_len(buf) {
            if len > MAX_HEADER_BLOCK {
                return Err(HandshakeError::HeaderTooLarge(len).into());
            }
            return Ok(len);
        }
        if buf.len() > MAX_HEADER_BLOCK {
            return Err(HandshakeError::HeaderTooLarge(buf.len()).into());
        }
        buf.reserve(4096);
        if read.read_buf(buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}

/// Failure while reading a handshake head.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

async fn initiate(
    read: &mut OwnedReadHalf,
    write: &mut OwnedWriteHalf,
    request: &HandshakeRequest,
    shared: &[u8; 32],
) -> Result<BytesMut, ConnectError> {
    write.write_all(&request.to_bytes()).await?;
    write.flush().await?;

    let mut buf = BytesMut::new();
    let len = match read_head(read, &mut buf).await {
        Ok(len) => len,
        Err(HandshakeReadError::Io(e)) => return Err(e.into()),
        Err(HandshakeReadError::Handshake(e)) => return Err(ConnectError::InvalidResponse(e)),
    };
    let head = buf.split_to(len);
    let response = HandshakeResponse::parse(&head).map_err(ConnectError::InvalidResponse)?;

    if response.status != 101 {
        let want = response.content_length().min(MAX_REJECTION_BODY);
        while buf.len() < want {
            if read.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        let body = String::from_utf8_lossy(&buf[..buf.len().min(want)]).into_owned();
        debug!(status = response.status, %body, "handshake rejected");
        return Err(ConnectError::Rejected {
            status: response.status,
            reason: response.reason,
            body,
        });
    }

    response
        .validate(shared)
        .map_err(ConnectError::InvalidResponse)?;
    Ok(buf)
}

async fn respond(
    stream: &mut TcpStream,
    key: &NodeKey,
    shared: &[u8; 32],
) -> Result<BytesMut, ConnectError> {
    let mut buf = BytesMut::new();
    let parsed = match read_head(stream, &mut buf).await {
        Ok(len) => {
            let head = buf.split_to(len);
            HandshakeRequest::parse(&head).and_then(|req| req.validate(shared, network_time_now()))
        }
        Err(HandshakeReadError::Io(e)) => return Err(e.into()),
        Err(HandshakeReadError::Handshake(e)) => Err(e),
    };

    match parsed {
        Ok(accepted) => {
            let response = HandshakeResponse::accept(
                concat!("ledger-conformance/", env!("CARGO_PKG_VERSION")),
                accepted.version,
                key,
                shared,
            );
            stream.write_all(&response.to_bytes()).await?;
            Ok(buf)
        }
        Err(err) => {
            let response = HandshakeResponse::reject(400, "Bad Request", err.to_string());
            let _ = stream.write_all(&response.to_bytes()).await;
            Err(ConnectError::InvalidRequest(err))
        }
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    mut buf: BytesMut,
    tx: mpsc::Sender<Inbound>,
    codec: Codec,
    pong_writer: Option<SharedWriter>,
    open: Arc<AtomicBool>,
) {
    let event = loop {
        match codec.decode_frame(&mut buf) {
            Ok(Some(msg)) => {
                trace!(kind = msg.kind(), "recv");
                if let (Some(writer), ProtocolMessage::Ping(ping)) = (&pong_writer, &msg) {
                    if !ping.is_pong() {
                        match codec.encode(&ProtocolMessage::Ping(ping.reply())) {
                            Ok(pong) => {
                                let mut writer = writer.lock().await;
                                if let Err(e) = writer.write_all(&pong).await {
                                    warn!(error = %e, "auto pong failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "auto pong not encodable"),
                        }
                    }
                }
                if tx.send(Inbound::Message(msg)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "malformed frame from remote");
                break Inbound::Malformed(err);
            }
        }

        match read.read_buf(&mut buf).await {
            Ok(0) => break Inbound::Closed,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "read failed");
                break Inbound::Closed;
            }
        }
    };
    open.store(false, Ordering::Release);
    let _ = tx.send(event).await;
}

// =============================================================================
// Listener
// =============================================================================

/// Accepts connections the target initiates towards a leased address.
pub struct SyntheticListener {
    lease: Arc<AddressLease>,
    listener: TcpListener,
    config: PeerConfig,
    key: NodeKey,
}

impl fmt::Debug for SyntheticListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticListener")
            .field("addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl SyntheticListener {
    /// Listen on `port` at the leased address.
    pub async fn bind(
        lease: impl Into<Arc<AddressLease>>,
        port: u16,
        config: PeerConfig,
    ) -> io::Result<Self> {
        let lease = lease.into();
        let addr = SocketAddr::new(lease.addr(), port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(64)?;
        debug!(%addr, "listening");
        let key = config.node_key.clone().unwrap_or_else(NodeKey::generate);
        Ok(Self {
            lease,
            listener,
            config,
            key,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the target to connect and finish the responder side of the handshake.
    pub async fn accept(&self, timeout: Duration) -> Result<SyntheticPeer, ConnectError> {
        let deadline = Instant::now() + timeout;
        let (mut stream, remote) = tokio::time::timeout_at(deadline, self.listener.accept())
            .await
            .map_err(|_| ConnectError::HandshakeTimeout(timeout))??;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        debug!(%local, %remote, "accepted");

        let leftover = match &self.config.handshake {
            Some(_) => {
                let shared = shared_value(remote, local);
                tokio::time::timeout_at(deadline, respond(&mut stream, &self.key, &shared))
                    .await
                    .map_err(|_| ConnectError::HandshakeTimeout(timeout))??
            }
            None => BytesMut::new(),
        };

        let mut config = self.config.clone();
        config.node_key = Some(self.key.clone());
        let mut peer = SyntheticPeer::from_shared_lease(Arc::clone(&self.lease), config);
        let (read, write) = stream.into_split();
        peer.start(local, remote, read, write, leftover);
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AddressPool;
    use ledger_protocol::Ping;

    fn pool() -> Arc<AddressPool> {
        AddressPool::new(vec!["127.0.0.1".parse().unwrap(); 1]).unwrap()
    }

    #[tokio::test]
    async fn peers_handshake_with_a_listener() {
        let pool = pool();
        let listener = SyntheticListener::bind(pool.checkout().unwrap(), 0, PeerConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        // Both ends share the single loopback lease.
        let lease = Arc::clone(&listener.lease);
        let mut peer = SyntheticPeer::from_shared_lease(lease, PeerConfig::default());

        let (accepted, connected) =
            tokio::join!(listener.accept(Duration::from_secs(5)), peer.connect(addr));
        connected.unwrap();
        let mut accepted = accepted.unwrap();
        assert!(peer.is_connected());

        peer.send(ProtocolMessage::Ping(Ping::ping(7))).await.unwrap();
        let got = accepted.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, ProtocolMessage::Ping(Ping::ping(7)));

        // auto_pong on the accepting side answered it.
        let pong = peer.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pong, ProtocolMessage::Ping(Ping::pong(7)));

        accepted.close().await;
        accepted.close().await;
        assert!(peer.expect_disconnect(Duration::from_secs(5)).await);
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn recv_times_out_and_reports_malformed_input() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            stream.write_all(&[0, 0, 0, 0, 0xff, 0xff]).await.unwrap();
            stream
        });

        let pool = pool();
        let mut peer = SyntheticPeer::new(pool.checkout().unwrap(), PeerConfig::without_handshake());
        peer.connect(addr).await.unwrap();

        assert!(matches!(
            peer.recv(Duration::from_millis(50)).await,
            Err(RecvError::Timeout(_))
        ));
        assert!(matches!(
            peer.recv(Duration::from_secs(5)).await,
            Err(RecvError::Malformed(MalformedMessage::UnknownTag(0xffff)))
        ));
        assert_eq!(peer.state(), PeerState::Closed);
        drop(server);
    }

    #[tokio::test]
    async fn rejection_carries_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            read_head(&mut stream, &mut buf).await.unwrap();
            let busy = HandshakeResponse::redirect(&["10.1.1.1:51235".parse().unwrap()]);
            stream.write_all(&busy.to_bytes()).await.unwrap();
        });

        let pool = pool();
        let mut peer = SyntheticPeer::new(pool.checkout().unwrap(), PeerConfig::default());
        match peer.connect(addr).await {
            Err(ConnectError::Rejected { status, body, .. }) => {
                assert_eq!(status, 503);
                assert!(body.contains("peer-ips"), "{body}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!peer.is_connected());
        assert!(matches!(
            peer.connect(addr).await,
            Err(ConnectError::InvalidState(PeerState::Closed))
        ));
    }

    #[tokio::test]
    async fn one_budget_bounds_connect_and_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts, reads the request, never answers.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let _ = read_head(&mut stream, &mut buf).await;
            std::future::pending::<()>().await;
        });

        let budget = Duration::from_millis(300);
        let pool = pool();
        let mut peer = SyntheticPeer::new(
            pool.checkout().unwrap(),
            PeerConfig {
                handshake_timeout: budget,
                ..PeerConfig::default()
            },
        );
        let start = Instant::now();
        let result = peer.connect(addr).await;
        let elapsed = start.elapsed();

        assert!(
            matches!(result, Err(ConnectError::HandshakeTimeout(t)) if t == budget),
            "{result:?}"
        );
        assert!(elapsed >= budget, "{elapsed:?}");
        assert!(elapsed < budget + Duration::from_millis(250), "{elapsed:?}");
        server.abort();
    }

    #[tokio::test]
    async fn dropping_the_peer_returns_the_lease() {
        let pool = pool();
        let peer = SyntheticPeer::new(pool.checkout().unwrap(), PeerConfig::default());
        assert_eq!(pool.available(), 0);
        drop(peer);
        assert_eq!(pool.available(), 1);
    }
}
