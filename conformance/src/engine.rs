//! Case registry and the single-case runner.

use std::any::Any;
use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::testcase::{CaseContext, CaseError, Subtasks, TestCase, TestOutcome};

/// Two cases share a name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("test case {0} registered twice")]
pub struct DuplicateCase(pub &'static str);

/// Ordered collection of test cases.
///
/// Cases run in the order they were declared; that order is fixed by the
/// source and identical from run to run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    cases: Vec<TestCase>,
}

impl Registry {
    pub fn new(cases: Vec<TestCase>) -> Result<Self, DuplicateCase> {
        let mut seen = HashSet::with_capacity(cases.len());
        for case in &cases {
            if !seen.insert(case.name) {
                return Err(DuplicateCase(case.name));
            }
        }
        Ok(Self { cases })
    }

    /// The built-in battery.
    pub fn declared() -> Self {
        Self {
            cases: crate::tests::declared(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|c| c.name == name)
    }

    /// Cases named `filter` exactly, or in the group `filter`.
    pub fn filter(&self, filter: &str) -> Self {
        let group = format!("{}.", filter.trim_end_matches('.'));
        Self {
            cases: self
                .cases
                .iter()
                .filter(|c| c.name == filter || c.name.starts_with(&group))
                .copied()
                .collect(),
        }
    }

    /// Union of several filters, keeping declared order.
    pub fn select<S: AsRef<str>>(&self, filters: &[S]) -> Self {
        if filters.is_empty() {
            return self.clone();
        }
        let keep: HashSet<&str> = filters
            .iter()
            .flat_map(|f| self.filter(f.as_ref()).cases)
            .map(|c| c.name)
            .collect();
        Self {
            cases: self
                .cases
                .iter()
                .filter(|c| keep.contains(c.name))
                .copied()
                .collect(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.cases.iter().map(|c| c.name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a TestCase;
    type IntoIter = std::slice::Iter<'a, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.iter()
    }
}

/// Run one case in its own task, bounded by `timeout`.
///
/// On expiry the task is aborted and awaited. Tasks the case spawned
/// through [`CaseContext::spawn`] are shut down on every path, so every
/// peer and lease the case owned is dropped before this returns.
pub async fn run_case(
    case: &TestCase,
    mut ctx: CaseContext,
    timeout: Duration,
) -> (TestOutcome, Duration) {
    let start = Instant::now();
    let func = case.func;
    let tasks = Subtasks::default();
    ctx.tasks = tasks.clone();
    let mut task = tokio::spawn(async move {
        let mut ctx = ctx;
        func(&mut ctx).await
    });

    let outcome = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => TestOutcome::Passed,
        Ok(Ok(Err(err @ CaseError::Assertion { .. }))) => TestOutcome::Failed(err.to_string()),
        Ok(Ok(Err(CaseError::Harness(reason)))) => TestOutcome::HarnessError(reason),
        Ok(Err(join)) if join.is_panic() => {
            let message = panic_message(join.into_panic());
            warn!(case = case.name, %message, "case panicked");
            TestOutcome::HarnessError(format!("panicked: {message}"))
        }
        Ok(Err(_)) => TestOutcome::HarnessError("case task cancelled".into()),
        Err(_) => {
            task.abort();
            let _ = task.await;
            debug!(case = case.name, ?timeout, "case aborted");
            TestOutcome::TimedOut
        }
    };
    if !tasks.is_empty() {
        debug!(case = case.name, subtasks = tasks.len(), "stopping case subtasks");
    }
    tasks.shutdown().await;
    (outcome, start.elapsed())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AddressPool;
    use crate::testcase::{CaseFn, CaseResult};
    use futures::future::BoxFuture;

    fn ctx() -> CaseContext {
        let pool = AddressPool::new(vec!["127.0.0.1".parse().unwrap()]).unwrap();
        CaseContext::new("127.0.0.1:9".parse().unwrap(), pool)
    }

    fn passes(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(async { Ok(()) })
    }

    fn fails(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(async { Err(CaseError::assertion("pong", "nothing")) })
    }

    fn breaks(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(async { Err(CaseError::harness("pool exhausted")) })
    }

    fn panics(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(async {
            let peers: Vec<u8> = Vec::new();
            assert!(!peers.is_empty(), "boom");
            Ok(())
        })
    }

    async fn hold_lease_forever(ctx: &mut CaseContext) -> CaseResult {
        let _lease = ctx.pool.checkout()?;
        std::future::pending::<()>().await;
        Ok(())
    }

    fn hangs(ctx: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(hold_lease_forever(ctx))
    }

    async fn spawn_lease_holders(ctx: &mut CaseContext) -> CaseResult {
        for _ in 0..4 {
            let lease = ctx.pool.checkout()?;
            drop(ctx.spawn(async move {
                let _lease = lease;
                std::future::pending::<()>().await;
            }));
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    fn hangs_in_subtasks(ctx: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(spawn_lease_holders(ctx))
    }

    async fn leave_lease_holder(ctx: &mut CaseContext) -> CaseResult {
        let lease = ctx.pool.checkout()?;
        drop(ctx.spawn(async move {
            let _lease = lease;
            std::future::pending::<()>().await;
        }));
        Ok(())
    }

    fn returns_early(ctx: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(leave_lease_holder(ctx))
    }

    fn pool_of(n: u8) -> CaseContext {
        let addrs = (1..=n)
            .map(|i| std::net::IpAddr::from([127, 0, 0, i]))
            .collect();
        CaseContext::new("127.0.0.1:9".parse().unwrap(), AddressPool::new(addrs).unwrap())
    }

    #[tokio::test]
    async fn outcomes_map_from_case_results() {
        let timeout = Duration::from_secs(5);
        let run = |f: CaseFn| async move {
            run_case(&TestCase::functional("t.x", f), ctx(), timeout)
                .await
                .0
        };

        assert_eq!(run(passes).await, TestOutcome::Passed);
        assert_eq!(
            run(fails).await,
            TestOutcome::Failed("expected pong, got nothing".into())
        );
        assert_eq!(
            run(breaks).await,
            TestOutcome::HarnessError("pool exhausted".into())
        );
        assert_eq!(
            run(panics).await,
            TestOutcome::HarnessError("panicked: boom".into())
        );
    }

    #[tokio::test]
    async fn timeout_aborts_and_releases_resources() {
        let ctx = ctx();
        let pool = ctx.pool.clone();
        let case = TestCase::functional("t.hang", hangs);
        let (outcome, elapsed) = run_case(&case, ctx, Duration::from_millis(100)).await;
        assert_eq!(outcome, TestOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(100));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn timeout_waits_for_case_subtasks() {
        let ctx = pool_of(4);
        let pool = ctx.pool.clone();
        let case = TestCase::functional("t.hang_in_subtasks", hangs_in_subtasks);
        let (outcome, _) = run_case(&case, ctx, Duration::from_millis(100)).await;
        assert_eq!(outcome, TestOutcome::TimedOut);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn finished_case_does_not_leak_subtasks() {
        let ctx = pool_of(2);
        let pool = ctx.pool.clone();
        let case = TestCase::functional("t.returns_early", returns_early);
        let (outcome, _) = run_case(&case, ctx, Duration::from_secs(5)).await;
        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn registry_rejects_duplicates_and_filters() {
        let registry = Registry::new(vec![
            TestCase::functional("handshake.accepted", passes),
            TestCase::functional("handshake.bad", fails),
            TestCase::functional("handshakes.other", passes),
            TestCase::performance("performance.load", passes),
        ])
        .unwrap();

        assert_eq!(
            registry.filter("handshake").names(),
            vec!["handshake.accepted", "handshake.bad"]
        );
        assert_eq!(registry.filter("handshake.bad").names(), vec!["handshake.bad"]);
        assert_eq!(
            registry.select(&["performance", "handshake.accepted"]).names(),
            vec!["handshake.accepted", "performance.load"]
        );
        assert!(registry.get("missing").is_none());

        let dup = Registry::new(vec![
            TestCase::functional("a.b", passes),
            TestCase::functional("a.b", fails),
        ]);
        assert_eq!(dup.unwrap_err(), DuplicateCase("a.b"));
    }
}
