//! Minimal ledger peer used to exercise the harness.
//!
//! Speaks just enough of the protocol for the built-in battery to pass:
//! validates the upgrade handshake, enforces a peer limit, advertises
//! endpoints, answers pings and hangs up on malformed frames. It also dials
//! the peers it was started with.
//!
//! Configured through the same environment the harness gives any target:
//!
//! - `LEDGER_TARGET_LISTEN`: listen address (required)
//! - `LEDGER_TARGET_PEERS`: comma-separated initial peers
//! - `LEDGER_TARGET_MAX_PEERS`: inbound session limit
//! - `LEDGER_TARGET_DATA_DIR`: unused beyond logging
//!
//! Misbehaviour switches, for checking that the battery notices:
//!
//! - `MOCK_TARGET_MAX_SESSIONS=n`: exit when handshake `n + 1` arrives
//! - `MOCK_TARGET_ACCEPT_ALL=1`: upgrade requests that fail validation
//! - `MOCK_TARGET_NO_PONG=1`: never answer pings

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use ledger_conformance::peer::{HandshakeReadError, read_head};
use ledger_conformance::target::{ENV_DATA_DIR, ENV_LISTEN, ENV_MAX_PEERS, ENV_PEERS};
use ledger_protocol::handshake::MAX_VERSION;
use ledger_protocol::{
    Codec, Endpoint, Endpoints, HandshakeCfg, HandshakeRequest, HandshakeResponse, NodeKey,
    ProtocolMessage, network_time_now, shared_value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const SERVER: &str = concat!("ledger-mock-target/", env!("CARGO_PKG_VERSION"));

/// Frames above this are treated as hostile.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a refused peer gets to finish sending before the socket drops.
const LINGER: Duration = Duration::from_millis(500);

struct Node {
    key: NodeKey,
    listen: SocketAddr,
    seeds: Vec<SocketAddr>,
    max_peers: usize,
    inbound: AtomicUsize,
    handshakes: AtomicUsize,
    max_sessions: Option<usize>,
    accept_all: bool,
    no_pong: bool,
    codec: Codec,
}

impl Node {
    /// Claim an inbound slot; false when the limit is reached.
    fn claim_slot(&self) -> bool {
        self.inbound
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_peers).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.inbound.fetch_sub(1, Ordering::AcqRel);
    }

    fn count_handshake(&self) {
        let n = self.handshakes.fetch_add(1, Ordering::AcqRel);
        if self.max_sessions.is_some_and(|max| n >= max) {
            warn!(handshakes = n + 1, "session budget exhausted, exiting");
            std::process::exit(3);
        }
    }

    fn endpoints(&self) -> ProtocolMessage {
        ProtocolMessage::Endpoints(Endpoints {
            version: 2,
            endpoints_v2: std::iter::once(self.listen)
                .chain(self.seeds.iter().copied())
                .map(|addr| Endpoint::new(addr, 0))
                .collect(),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str) -> bool {
    env_var(name).is_some_and(|v| !matches!(v.trim(), "0" | "false"))
}

#[tokio::main]
async fn main() {
    ledger_conformance::try_init_tracing("info");

    let listen: SocketAddr = env_var(ENV_LISTEN)
        .expect("LEDGER_TARGET_LISTEN is required")
        .parse()
        .expect("LEDGER_TARGET_LISTEN is not a socket address");
    let seeds: Vec<SocketAddr> = env_var(ENV_PEERS)
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().parse().expect("bad address in LEDGER_TARGET_PEERS"))
                .collect()
        })
        .unwrap_or_default();
    let max_peers = env_var(ENV_MAX_PEERS)
        .map(|v| v.parse().expect("LEDGER_TARGET_MAX_PEERS is not a number"))
        .unwrap_or(16);
    let max_sessions = env_var("MOCK_TARGET_MAX_SESSIONS")
        .map(|v| v.parse().expect("MOCK_TARGET_MAX_SESSIONS is not a number"));

    let node = Arc::new(Node {
        key: NodeKey::generate(),
        listen,
        seeds,
        max_peers,
        inbound: AtomicUsize::new(0),
        handshakes: AtomicUsize::new(0),
        max_sessions,
        accept_all: env_flag("MOCK_TARGET_ACCEPT_ALL"),
        no_pong: env_flag("MOCK_TARGET_NO_PONG"),
        codec: Codec::with_max_payload(MAX_FRAME_PAYLOAD),
    });

    let listener = TcpListener::bind(listen)
        .await
        .expect("failed to bind listen address");
    info!(
        %listen,
        max_peers,
        data_dir = ?env_var(ENV_DATA_DIR),
        seeds = ?node.seeds,
        accept_all = node.accept_all,
        no_pong = node.no_pong,
        "mock target listening"
    );

    for &seed in &node.seeds {
        tokio::spawn(dial_seed(Arc::clone(&node), seed));
    }

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tokio::spawn(serve_inbound(Arc::clone(&node), stream, remote));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn reject(stream: &mut TcpStream, response: HandshakeResponse) {
    let _ = stream.write_all(&response.to_bytes()).await;
    let _ = stream.shutdown().await;
    // Drain whatever the peer still sends so the close is a FIN, not a
    // reset that could discard the response.
    let mut sink = [0u8; 4096];
    let _ = tokio::time::timeout(LINGER, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

async fn serve_inbound(node: Arc<Node>, mut stream: TcpStream, remote: SocketAddr) {
    let Ok(local) = stream.local_addr() else {
        return;
    };
    let mut buf = BytesMut::new();
    let head = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_head(&mut stream, &mut buf)).await
    {
        Ok(Ok(len)) => buf.split_to(len),
        Ok(Err(HandshakeReadError::Handshake(e))) => {
            debug!(%remote, error = %e, "bad handshake head");
            reject(&mut stream, HandshakeResponse::reject(400, "Bad Request", e.to_string())).await;
            return;
        }
        // Probes and peers that hang up before sending a head.
        Ok(Err(HandshakeReadError::Io(_))) | Err(_) => return,
    };

    node.count_handshake();
    let shared = shared_value(remote, local);
    let version = match HandshakeRequest::parse(&head)
        .and_then(|request| request.validate(&shared, network_time_now()))
    {
        Ok(accepted) => accepted.version,
        Err(e) if node.accept_all => {
            warn!(%remote, error = %e, "accepting invalid handshake");
            MAX_VERSION
        }
        Err(e) => {
            debug!(%remote, error = %e, "handshake refused");
            reject(&mut stream, HandshakeResponse::reject(400, "Bad Request", e.to_string())).await;
            return;
        }
    };

    if !node.claim_slot() {
        debug!(%remote, "peer limit reached");
        let mut known = node.seeds.clone();
        known.push(node.listen);
        reject(&mut stream, HandshakeResponse::redirect(&known)).await;
        return;
    }

    let response = HandshakeResponse::accept(SERVER, version, &node.key, &shared);
    if stream.write_all(&response.to_bytes()).await.is_ok() {
        debug!(%remote, %version, "inbound session open");
        session(&node, stream, buf, remote).await;
    }
    node.release_slot();
}

async fn dial_seed(node: Arc<Node>, seed: SocketAddr) {
    let mut stream = loop {
        match TcpStream::connect(seed).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(DIAL_INTERVAL).await,
        }
    };
    let (Ok(local), Ok(remote)) = (stream.local_addr(), stream.peer_addr()) else {
        return;
    };
    let shared = shared_value(local, remote);
    let request = HandshakeRequest::build(
        &HandshakeCfg {
            http_ident: SERVER.to_string(),
            ..HandshakeCfg::default()
        },
        &node.key,
        &shared,
    );
    if stream.write_all(&request.to_bytes()).await.is_err() {
        return;
    }

    let mut buf = BytesMut::new();
    let head = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_head(&mut stream, &mut buf)).await
    {
        Ok(Ok(len)) => buf.split_to(len),
        Ok(Err(e)) => {
            warn!(%seed, error = %e, "seed handshake failed");
            return;
        }
        Err(_) => {
            warn!(%seed, "seed handshake timed out");
            return;
        }
    };
    let version = HandshakeResponse::parse(&head).and_then(|response| response.validate(&shared));
    match version {
        Ok(version) => {
            info!(%seed, %version, "connected to seed");
            session(&node, stream, buf, remote).await;
        }
        Err(e) => warn!(%seed, error = %e, "seed refused handshake"),
    }
}

/// Framed messaging after a successful handshake.
async fn session(node: &Node, mut stream: TcpStream, mut buf: BytesMut, remote: SocketAddr) {
    let endpoints = match node.codec.encode(&node.endpoints()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%remote, error = %e, "cannot encode endpoints");
            return;
        }
    };
    if stream.write_all(&endpoints).await.is_err() {
        return;
    }

    loop {
        loop {
            match node.codec.decode_frame(&mut buf) {
                Ok(Some(ProtocolMessage::Ping(ping))) if !ping.is_pong() && !node.no_pong => {
                    let Ok(pong) = node.codec.encode(&ProtocolMessage::Ping(ping.reply())) else {
                        return;
                    };
                    if stream.write_all(&pong).await.is_err() {
                        return;
                    }
                }
                Ok(Some(msg)) => debug!(%remote, kind = msg.kind(), "ignored"),
                Ok(None) => break,
                Err(e) => {
                    debug!(%remote, error = %e, "malformed frame, disconnecting");
                    return;
                }
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                debug!(%remote, "session closed");
                return;
            }
            Ok(_) => {}
        }
    }
}
