//! Conformance and performance harness for ledger peer nodes.
//!
//! The harness starts a node binary (the target), impersonates many peers
//! from distinct local addresses and checks that the target speaks the peer
//! protocol correctly: the upgrade handshake, framed messages, and its
//! behavior under malformed input and connection load.
//!
//! # Layout
//!
//! - [`pool`]: local addresses synthetic peers bind to
//! - [`peer`]: a synthetic peer (and listener) speaking the protocol
//! - [`testcase`], [`engine`], [`tests`]: cases, the registry and the runner
//! - [`target`], [`orchestrator`]: the target process and a whole run
//! - [`report`], [`diff`]: run reports and their comparison
//! - [`config`]: TOML configuration
//!
//! # Usage
//!
//! ```bash
//! ledger-conformance run --target ./node --config harness.toml
//! ledger-conformance list --category performance
//! ledger-conformance diff
//! ```

pub mod config;
pub mod diff;
pub mod engine;
pub mod orchestrator;
pub mod peer;
pub mod pool;
pub mod report;
pub mod target;
pub mod testcase;
pub mod tests;

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber, honoring `RUST_LOG` and falling back
/// to `default_filter`. Returns false if a subscriber was already installed.
pub fn try_init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
