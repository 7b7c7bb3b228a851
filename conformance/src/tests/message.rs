//! Message exchange conformance tests.

use ledger_protocol::{Ping, ProtocolMessage};

use crate::peer::PeerConfig;
use crate::testcase::{CaseContext, CaseError, CaseResult};
use crate::ensure;

// =============================================================================
// message.ping_pong
// =============================================================================
// A ping is answered with a pong carrying the same sequence number.

pub async fn ping_pong(ctx: &mut CaseContext) -> CaseResult {
    let mut peer = ctx.connect().await?;
    let seq = rand_seq();
    peer.send(ProtocolMessage::Ping(Ping::ping(seq))).await?;

    let answered = peer
        .expect_message(
            |msg| matches!(msg, ProtocolMessage::Ping(p) if p.is_pong() && p.seq == Some(seq)),
            ctx.recv_timeout,
        )
        .await;
    ensure!(answered, "pong with seq {seq} within {:?}", ctx.recv_timeout);
    Ok(())
}

fn rand_seq() -> u32 {
    // Low bits of the clock are enough to tell runs apart.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(1)
}

// =============================================================================
// message.endpoints_after_handshake
// =============================================================================
// The target advertises its known peers once the session is up.

pub async fn endpoints_after_handshake(ctx: &mut CaseContext) -> CaseResult {
    let mut peer = ctx.connect().await?;
    let seen = peer
        .expect_message(
            |msg| matches!(msg, ProtocolMessage::Endpoints(_)),
            ctx.recv_timeout,
        )
        .await;
    ensure!(seen, "Endpoints message within {:?}", ctx.recv_timeout);
    Ok(())
}

// =============================================================================
// message.silent_before_handshake
// =============================================================================
// Without a handshake the target must not send protocol messages.

pub async fn silent_before_handshake(ctx: &mut CaseContext) -> CaseResult {
    let mut peer = ctx.connect_with(PeerConfig {
        auto_pong: false,
        ..PeerConfig::without_handshake()
    })
    .await?;

    match peer.recv(ctx.quiet_period).await {
        Ok(msg) => Err(CaseError::assertion(
            "no messages before the handshake",
            format!("{} message", msg.kind()),
        )),
        // Silence, a closed socket or bytes that are not frames all count.
        Err(_) => Ok(()),
    }
}
