//! Connections initiated by the target.

use ledger_protocol::{Ping, ProtocolMessage};
use tracing::debug;

use crate::testcase::{CaseContext, CaseError, CaseResult};
use crate::ensure;

// =============================================================================
// inbound.seed_connection
// =============================================================================
// The target dials the seed peer it was started with and completes the
// handshake as the initiator.

pub async fn seed_connection(ctx: &mut CaseContext) -> CaseResult {
    let listener = ctx.listener(0).await?;
    let wait = ctx.handshake_timeout + ctx.recv_timeout;

    let mut peer = match listener.accept(wait).await {
        Ok(peer) => peer,
        Err(err) => {
            return Err(CaseError::assertion(
                format!("target to dial seed {}", listener.local_addr()?),
                err.to_string(),
            ));
        }
    };
    debug!(remote = ?peer.remote_addr(), "target connected to seed");

    peer.send(ProtocolMessage::Ping(Ping::ping(77))).await?;
    let answered = peer
        .expect_message(
            |msg| matches!(msg, ProtocolMessage::Ping(p) if p.is_pong() && p.seq == Some(77)),
            ctx.recv_timeout,
        )
        .await;
    ensure!(answered, "pong on the target-initiated session");
    Ok(())
}
