//! Built-in test battery.
//!
//! Each module holds the cases for one area of the protocol. Cases are plain
//! `async fn(&mut CaseContext) -> CaseResult` bodies; [`declared`] lists them
//! in the order a run executes them.

pub mod inbound;
pub mod message;
pub mod performance;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::testcase::{CaseContext, CaseResult, TestCase};

/// Box an `async fn` case body into a [`TestCase`].
macro_rules! case {
    ($kind:ident $name:literal => $body:path) => {{
        fn shim(ctx: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
            Box::pin($body(ctx))
        }
        TestCase::$kind($name, shim)
    }};
}

/// Every built-in case, in execution order.
pub fn declared() -> Vec<TestCase> {
    vec![
        case!(functional "handshake.accepted" => handshake::accepted),
        case!(functional "handshake.rejects_bad_upgrade" => handshake::rejects_bad_upgrade),
        case!(functional "handshake.rejects_bad_connection" => handshake::rejects_bad_connection),
        case!(functional "handshake.rejects_bad_connect_as" => handshake::rejects_bad_connect_as),
        case!(functional "handshake.user_agent_limit" => handshake::user_agent_limit),
        case!(functional "handshake.rejects_skewed_network_time" => handshake::rejects_skewed_network_time),
        case!(functional "handshake.rejects_flipped_public_key" => handshake::rejects_flipped_public_key),
        case!(functional "handshake.rejects_flipped_shared_value" => handshake::rejects_flipped_shared_value),
        case!(functional "handshake.concurrent_distinct_addresses" => handshake::concurrent_distinct_addresses),
        case!(functional "message.ping_pong" => message::ping_pong),
        case!(functional "message.endpoints_after_handshake" => message::endpoints_after_handshake),
        case!(functional "message.silent_before_handshake" => message::silent_before_handshake),
        case!(functional "resistance.unknown_tag" => resistance::unknown_tag),
        case!(functional "resistance.oversized_length" => resistance::oversized_length),
        case!(functional "resistance.truncated_frame" => resistance::truncated_frame),
        case!(functional "inbound.seed_connection" => inbound::seed_connection),
        case!(performance "performance.connection_load" => performance::connection_load)
            .with_timeout(Duration::from_secs(60)),
        case!(performance "performance.ping_latency" => performance::ping_latency),
    ]
}
