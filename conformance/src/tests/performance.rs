//! Performance tests.
//!
//! These run alone against the target; their recorded duration is what
//! the differ compares between runs.

use std::time::Duration;

use futures::future::join_all;
use ledger_protocol::{Ping, ProtocolMessage};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::peer::{ConnectError, RecvError, SyntheticPeer};
use crate::testcase::{CaseContext, CaseError, CaseResult};
use crate::{ensure, ensure_eq};

// =============================================================================
// performance.connection_load
// =============================================================================
// More peers than the target's limit dial in at once. The target accepts at
// most `max_peers`, refuses the rest during the handshake and keeps every
// session it accepted.

/// Peers beyond the target's limit.
const LOAD_EXCESS: usize = 10;

/// How long accepted sessions are held open.
const LOAD_HOLD: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ConnectionStats {
    peers: usize,
    accepted: usize,
    rejected: usize,
    terminated: usize,
    errors: usize,
    timed_out: usize,
}

enum PeerFate {
    Accepted { terminated: bool },
    Rejected,
    TimedOut,
    Error(ConnectError),
}

async fn simulate_peer(
    mut peer: SyntheticPeer,
    target: std::net::SocketAddr,
    handshaken: oneshot::Sender<()>,
    hold_until: oneshot::Receiver<()>,
) -> PeerFate {
    let result = peer.connect(target).await;
    let _ = handshaken.send(());
    match result {
        Ok(()) => {}
        Err(ConnectError::Rejected { .. }) => return PeerFate::Rejected,
        Err(ConnectError::HandshakeTimeout(_)) => return PeerFate::TimedOut,
        Err(err) => return PeerFate::Error(err),
    }

    // Keep the session alive until released, consuming whatever arrives.
    tokio::pin!(hold_until);
    loop {
        tokio::select! {
            _ = &mut hold_until => return PeerFate::Accepted { terminated: false },
            received = peer.recv(Duration::from_millis(100)) => match received {
                Ok(_) | Err(RecvError::Timeout(_)) => {}
                Err(_) => return PeerFate::Accepted { terminated: true },
            },
        }
    }
}

pub async fn connection_load(ctx: &mut CaseContext) -> CaseResult {
    if ctx.max_peers == 0 {
        return Err(CaseError::harness("target peer limit unknown"));
    }
    let wanted = ctx.max_peers + LOAD_EXCESS;
    let count = wanted.min(ctx.pool.available());
    if count <= ctx.max_peers {
        return Err(CaseError::harness(format!(
            "need {wanted} free addresses to exceed the peer limit, have {}",
            ctx.pool.available()
        )));
    }

    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        peers.push(ctx.peer(ctx.peer_config())?);
    }

    let start = Instant::now();
    let mut fates = Vec::with_capacity(count);
    let mut handshakes = Vec::with_capacity(count);
    let mut releases = Vec::with_capacity(count);
    for peer in peers {
        let (done_tx, done_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        handshakes.push(done_rx);
        releases.push(release_tx);
        fates.push(ctx.spawn(simulate_peer(peer, ctx.target, done_tx, release_rx)));
    }

    // Every peer reports once its handshake finished, one way or the other.
    for done in handshakes {
        let _ = done.await;
    }
    tokio::time::sleep(LOAD_HOLD).await;
    for release in releases {
        let _ = release.send(());
    }

    let mut stats = ConnectionStats {
        peers: count,
        ..Default::default()
    };
    for fate in join_all(fates).await {
        match fate.map_err(|_| CaseError::harness("peer task ended without a result"))? {
            PeerFate::Accepted { terminated } => {
                stats.accepted += 1;
                stats.terminated += usize::from(terminated);
            }
            PeerFate::Rejected => stats.rejected += 1,
            PeerFate::TimedOut => stats.timed_out += 1,
            PeerFate::Error(err) => {
                debug!(error = %err, "connection error");
                stats.errors += 1;
            }
        }
    }
    info!(
        max_peers = ctx.max_peers,
        ?stats,
        elapsed = ?start.elapsed(),
        "connection load"
    );

    ensure_eq!(stats.terminated, 0, "accepted sessions stay open");
    ensure_eq!(stats.errors, 0, "no connection errors");
    ensure_eq!(stats.timed_out, 0, "no handshake timeouts");
    ensure!(
        stats.accepted <= ctx.max_peers,
        "at most {} sessions accepted, stats {stats:?}",
        ctx.max_peers
    );
    ensure_eq!(stats.rejected, stats.peers - stats.accepted, "the rest are refused");
    Ok(())
}

// =============================================================================
// performance.ping_latency
// =============================================================================
// Sequential ping round trips on one session.

const PING_ROUNDS: u32 = 100;

pub async fn ping_latency(ctx: &mut CaseContext) -> CaseResult {
    let mut peer = ctx.connect().await?;
    let mut samples = Vec::with_capacity(PING_ROUNDS as usize);

    for seq in 1..=PING_ROUNDS {
        let sent = Instant::now();
        peer.send(ProtocolMessage::Ping(Ping::ping(seq))).await?;
        let answered = peer
            .expect_message(
                |msg| matches!(msg, ProtocolMessage::Ping(p) if p.is_pong() && p.seq == Some(seq)),
                ctx.recv_timeout,
            )
            .await;
        ensure!(answered, "pong for ping {seq} within {:?}", ctx.recv_timeout);
        samples.push(sent.elapsed());
    }

    samples.sort();
    let pick = |q: usize| samples[(samples.len() * q / 100).min(samples.len() - 1)];
    info!(
        rounds = PING_ROUNDS,
        p50 = ?pick(50),
        p99 = ?pick(99),
        max = ?samples[samples.len() - 1],
        "ping latency"
    );
    Ok(())
}
