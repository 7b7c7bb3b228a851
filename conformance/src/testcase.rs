//! Test case metadata, outcomes and the context a case runs in.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::peer::{
    ConnectError, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RECV_TIMEOUT, PeerConfig, RecvError,
    SyntheticListener, SyntheticPeer,
};
use crate::pool::{AddressLease, AddressPool, PoolExhausted};

/// Kind of test. Performance cases never share the target with other cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Functional,
    Performance,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one case execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(String),
    TimedOut,
    HarnessError(String),
}

impl TestOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) | Self::HarnessError(reason) => Some(reason),
            Self::Passed | Self::TimedOut => None,
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::HarnessError(reason) => write!(f, "harness error: {reason}"),
        }
    }
}

/// Why a case body did not pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaseError {
    /// The target behaved differently from what the protocol requires.
    #[error("expected {expected}, got {actual}")]
    Assertion { expected: String, actual: String },

    /// The harness itself could not carry out the case.
    #[error("{0}")]
    Harness(String),
}

impl CaseError {
    pub fn assertion(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Assertion {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn harness(reason: impl Into<String>) -> Self {
        Self::Harness(reason.into())
    }
}

impl From<io::Error> for CaseError {
    fn from(e: io::Error) -> Self {
        Self::Harness(format!("i/o: {e}"))
    }
}

impl From<ConnectError> for CaseError {
    fn from(e: ConnectError) -> Self {
        Self::Harness(format!("connect: {e}"))
    }
}

impl From<RecvError> for CaseError {
    fn from(e: RecvError) -> Self {
        Self::Harness(format!("recv: {e}"))
    }
}

impl From<PoolExhausted> for CaseError {
    fn from(e: PoolExhausted) -> Self {
        Self::Harness(e.to_string())
    }
}

pub type CaseResult = Result<(), CaseError>;

/// Case body: setup, drive, assert.
pub type CaseFn = for<'a> fn(&'a mut CaseContext) -> BoxFuture<'a, CaseResult>;

/// A registered test case.
#[derive(Clone, Copy)]
pub struct TestCase {
    /// Dotted `<group>.<case>` name.
    pub name: &'static str,
    pub category: Category,
    /// Overrides the run's per-case timeout.
    pub timeout: Option<Duration>,
    pub func: CaseFn,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TestCase {
    pub const fn functional(name: &'static str, func: CaseFn) -> Self {
        Self {
            name,
            category: Category::Functional,
            timeout: None,
            func,
        }
    }

    pub const fn performance(name: &'static str, func: CaseFn) -> Self {
        Self {
            name,
            category: Category::Performance,
            timeout: None,
            func,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Group part of the name (before the first dot).
    pub fn group(&self) -> &'static str {
        self.name.split('.').next().unwrap_or(self.name)
    }
}

/// Background tasks spawned by one case.
///
/// The runner shuts them down and waits for them once the case body is
/// done, whether it finished, failed or timed out, so whatever they hold
/// (peers, leases) is released before the outcome is reported.
#[derive(Clone, Default)]
pub(crate) struct Subtasks(Arc<Mutex<JoinSet<()>>>);

impl Subtasks {
    fn spawn<F>(&self, fut: F) -> oneshot::Receiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.0.lock().spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Abort every task and wait until all of them are gone.
    pub(crate) async fn shutdown(&self) {
        let mut set = std::mem::take(&mut *self.0.lock());
        set.shutdown().await;
    }
}

/// Everything a case may touch: the target's address, the shared address
/// pool and the run's timeouts.
#[derive(Clone)]
pub struct CaseContext {
    pub target: SocketAddr,
    pub pool: Arc<AddressPool>,
    pub recv_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a case waits to conclude that the target stays silent.
    pub quiet_period: Duration,
    /// Peer limit the target was started with.
    pub max_peers: usize,
    /// Port seed listeners bind on.
    pub seed_port: u16,
    seeds: Vec<Arc<AddressLease>>,
    pub(crate) tasks: Subtasks,
}

impl fmt::Debug for CaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseContext")
            .field("target", &self.target)
            .field("pool", &self.pool)
            .field("seeds", &self.seed_addrs())
            .finish_non_exhaustive()
    }
}

impl CaseContext {
    pub fn new(target: SocketAddr, pool: Arc<AddressPool>) -> Self {
        Self {
            target,
            pool,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            quiet_period: Duration::from_secs(1),
            max_peers: 0,
            seed_port: 0,
            seeds: Vec::new(),
            tasks: Subtasks::default(),
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<Arc<AddressLease>>, port: u16) -> Self {
        self.seeds = seeds;
        self.seed_port = port;
        self
    }

    /// Addresses handed to the target as initial peers.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.seeds
            .iter()
            .map(|lease| SocketAddr::new(lease.addr(), self.seed_port))
            .collect()
    }

    /// Peer settings with this run's timeouts.
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            handshake_timeout: self.handshake_timeout,
            ..PeerConfig::default()
        }
    }

    /// Unconnected peer on a fresh pool address.
    pub fn peer(&self, config: PeerConfig) -> Result<SyntheticPeer, CaseError> {
        Ok(SyntheticPeer::new(self.pool.checkout()?, config))
    }

    /// Handshaken peer with default settings.
    pub async fn connect(&self) -> Result<SyntheticPeer, CaseError> {
        self.connect_with(self.peer_config()).await
    }

    pub async fn connect_with(&self, config: PeerConfig) -> Result<SyntheticPeer, CaseError> {
        let mut peer = self.peer(config)?;
        peer.connect(self.target).await?;
        Ok(peer)
    }

    /// Run `fut` next to the case body; its output arrives on the receiver.
    ///
    /// The task does not outlive the case: the runner cancels it when the
    /// case ends, dropping the sender.
    pub fn spawn<F>(&self, fut: F) -> oneshot::Receiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(fut)
    }

    /// Listener on the `index`-th seed address.
    pub async fn listener(&self, index: usize) -> Result<SyntheticListener, CaseError> {
        let lease = self.seeds.get(index).ok_or_else(|| {
            CaseError::harness(format!(
                "seed {index} requested, {} configured",
                self.seeds.len()
            ))
        })?;
        Ok(SyntheticListener::bind(Arc::clone(lease), self.seed_port, self.peer_config()).await?)
    }
}

/// Fail the case unless `cond` holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !$cond {
            return Err($crate::testcase::CaseError::assertion(
                stringify!($cond),
                "false",
            ));
        }
    };
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err($crate::testcase::CaseError::assertion(
                format!($($fmt)+),
                concat!("`", stringify!($cond), "` was false"),
            ));
        }
    };
}

/// Fail the case unless `actual == expected`.
#[macro_export]
macro_rules! ensure_eq {
    ($actual:expr, $expected:expr $(,)?) => {
        match (&$actual, &$expected) {
            (actual, expected) => {
                if actual != expected {
                    return Err($crate::testcase::CaseError::assertion(
                        format!("{} == {:?}", stringify!($actual), expected),
                        format!("{:?}", actual),
                    ));
                }
            }
        }
    };
    ($actual:expr, $expected:expr, $($fmt:tt)+) => {
        match (&$actual, &$expected) {
            (actual, expected) => {
                if actual != expected {
                    return Err($crate::testcase::CaseError::assertion(
                        format!("{} == {:?} ({})", stringify!($actual), expected, format!($($fmt)+)),
                        format!("{:?}", actual),
                    ));
                }
            }
        }
    };
}

/// Poll `cond` until it holds, failing the case after `timeout`.
#[macro_export]
macro_rules! wait_until {
    ($timeout:expr, $cond:expr $(,)?) => {{
        let timeout: ::std::time::Duration = $timeout;
        let deadline = ::tokio::time::Instant::now() + timeout;
        loop {
            if $cond {
                break;
            }
            if ::tokio::time::Instant::now() >= deadline {
                return Err($crate::testcase::CaseError::assertion(
                    stringify!($cond),
                    format!("still false after {:?}", timeout),
                ));
            }
            ::tokio::time::sleep(::std::time::Duration::from_millis(10)).await;
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(value: u32) -> CaseResult {
        ensure!(value > 1, "value above one");
        ensure_eq!(value % 2, 0);
        Ok(())
    }

    #[test]
    fn assertion_macros() {
        assert_eq!(checks(4), Ok(()));
        assert_eq!(
            checks(1),
            Err(CaseError::assertion("value above one", "`value > 1` was false"))
        );
        assert_eq!(
            checks(3),
            Err(CaseError::assertion("value % 2 == 0", "1"))
        );
    }

    #[tokio::test]
    async fn wait_until_gives_up() {
        async fn never() -> CaseResult {
            wait_until!(Duration::from_millis(30), false);
            Ok(())
        }
        async fn eventually() -> CaseResult {
            let start = tokio::time::Instant::now();
            wait_until!(
                Duration::from_secs(1),
                start.elapsed() > Duration::from_millis(20)
            );
            Ok(())
        }
        assert!(matches!(never().await, Err(CaseError::Assertion { .. })));
        assert_eq!(eventually().await, Ok(()));
    }

    #[test]
    fn outcome_reasons() {
        assert_eq!(TestOutcome::Failed("x".into()).reason(), Some("x"));
        assert_eq!(TestOutcome::TimedOut.reason(), None);
        assert!(TestOutcome::Passed.is_pass());
    }

    #[test]
    fn group_is_the_first_segment() {
        fn body(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
            Box::pin(async { Ok(()) })
        }
        let case = TestCase::functional("handshake.accepted", body);
        assert_eq!(case.group(), "handshake");
        assert_eq!(case.category, Category::Functional);
    }
}
