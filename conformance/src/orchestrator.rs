//! A complete run: start the target, execute the battery, record every
//! outcome, stop the target.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::config::{ConfigError, HarnessConfig, NetworkConfig};
use crate::engine::{Registry, run_case};
use crate::pool::{
    AddressLease, AddressPool, AllocationError, InterfaceBinder, IpCommandBinder, NoopBinder,
    PoolExhausted, Subnet, allocate, read_address_list,
};
use crate::report::{Recorder, ReportError, RunRecord};
use crate::target::{Backoff, TargetError, TargetLaunch, TargetProcess};
use crate::testcase::{CaseContext, Category, TestCase, TestOutcome};

/// Reason recorded for cases that never ran because the target was gone.
pub const TARGET_EXITED: &str = "target exited";

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    TargetStarting,
    TargetReady,
    /// Executing the case at this index in declared order.
    Running(usize),
    Finalizing,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::TargetStarting => f.write_str("target-starting"),
            Self::TargetReady => f.write_str("target-ready"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Failures that end a run before every case has a record.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("reserving seed peers: {0}")]
    Pool(#[from] PoolExhausted),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("failed to create target data directory: {0}")]
    DataDir(#[source] io::Error),
}

/// Tally of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub harness_errors: usize,
    /// Records that could not be written to the report.
    pub unwritten: usize,
    pub target_exited: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    fn count(&mut self, outcome: &TestOutcome) {
        self.total += 1;
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed(_) => self.failed += 1,
            TestOutcome::TimedOut => self.timed_out += 1,
            TestOutcome::HarnessError(_) => self.harness_errors += 1,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cases: {} passed, {} failed, {} timed out, {} harness errors in {:.2}s",
            self.total,
            self.passed,
            self.failed,
            self.timed_out,
            self.harness_errors,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Build the run's address pool from a saved address list or by allocating
/// from the configured subnet.
pub fn address_pool(network: &NetworkConfig) -> Result<Arc<AddressPool>, AllocationError> {
    let addrs = match &network.address_list {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "using saved address list");
            read_address_list(path)?
        }
        _ => {
            let subnet: Subnet = network.subnet.parse()?;
            let binder: &dyn InterfaceBinder = if subnet.is_loopback() {
                &NoopBinder
            } else {
                &IpCommandBinder
            };
            allocate(&subnet, network.peer_count, &network.interface, binder)?
        }
    };
    AddressPool::new(addrs)
}

/// Group cases into batches that run together.
///
/// Serial runs (and performance cases always) get one case per batch. With
/// `serial` off, consecutive functional cases share a batch of at most
/// `parallelism`.
pub fn schedule(cases: &[TestCase], serial: bool, parallelism: usize) -> Vec<Vec<TestCase>> {
    let width = if serial { 1 } else { parallelism.max(1) };
    let mut batches: Vec<Vec<TestCase>> = Vec::new();
    for case in cases {
        let joins_last = case.category == Category::Functional
            && batches.last().is_some_and(|last| {
                last.len() < width && last.iter().all(|c| c.category == Category::Functional)
            });
        match batches.last_mut() {
            Some(last) if joins_last => last.push(*case),
            _ => batches.push(vec![*case]),
        }
    }
    batches
}

/// Wall-clock timestamps anchored once per run.
struct RunClock {
    epoch_ms: u64,
    start: Instant,
}

impl RunClock {
    fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            epoch_ms,
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        let offset = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_ms.saturating_add(offset)
    }
}

/// Owns the target and the address pool for the duration of a run.
pub struct Orchestrator {
    config: HarnessConfig,
    registry: Registry,
    pool: Arc<AddressPool>,
    state: RunState,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .field("cases", &self.registry.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, registry: Registry, pool: Arc<AddressPool>) -> Self {
        Self {
            config,
            registry,
            pool,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        info!(from = %self.state, to = %next, "run state");
        self.state = next;
    }

    /// Execute every registered case against a freshly started target.
    ///
    /// Writes one record per case to the configured latest report, in
    /// declared order.
    pub async fn run(&mut self) -> Result<RunSummary, RunError> {
        let binary = self
            .config
            .target
            .binary
            .clone()
            .ok_or_else(|| ConfigError::Invalid("target.binary is not set".into()))?;
        let mut recorder = Recorder::create(&self.config.reports.latest)?;
        let clock = RunClock::new();
        let mut summary = RunSummary::default();

        self.transition(RunState::TargetStarting);
        let seeds = (0..self.config.network.seed_peers)
            .map(|_| self.pool.checkout().map(Arc::new))
            .collect::<Result<Vec<Arc<AddressLease>>, _>>()?;
        let seed_port = self.config.network.seed_port;
        let peers: Vec<SocketAddr> = seeds
            .iter()
            .map(|lease| SocketAddr::new(lease.addr(), seed_port))
            .collect();

        let data_dir = tempfile::Builder::new()
            .prefix("ledger-target-")
            .tempdir()
            .map_err(RunError::DataDir)?;
        let target_cfg = &self.config.target;
        let launch = TargetLaunch {
            binary,
            args: target_cfg.args.clone(),
            env: target_cfg.env.clone(),
            listen: target_cfg.listen,
            data_dir: data_dir.path().to_path_buf(),
            peers,
            max_peers: target_cfg.max_peers,
            relay_output: target_cfg.relay_output,
        };
        let backoff = Backoff {
            initial: target_cfg.start_backoff(),
            max: target_cfg.start_backoff_max(),
            attempts: target_cfg.start_attempts,
        };
        let mut target = TargetProcess::spawn(&launch)?;
        if let Err(err) = target.wait_ready(backoff).await {
            error!(error = %err, "target failed to start");
            let _ = target.stop().await;
            return Err(err.into());
        }
        self.transition(RunState::TargetReady);

        let run = &self.config.run;
        let mut ctx = CaseContext::new(launch.listen, Arc::clone(&self.pool))
            .with_seeds(seeds, seed_port);
        ctx.recv_timeout = run.recv_timeout();
        ctx.handshake_timeout = run.handshake_timeout();
        ctx.quiet_period = run.quiet_period();
        ctx.max_peers = launch.max_peers;
        let default_timeout = run.case_timeout();
        let crash_grace = run.crash_grace();

        let cases: Vec<TestCase> = self.registry.iter().copied().collect();
        let batches = schedule(&cases, run.serial, run.parallelism);
        let mut index = 0;

        for batch in batches {
            self.transition(RunState::Running(index));
            index += batch.len();

            if summary.target_exited {
                for case in &batch {
                    let outcome = TestOutcome::HarnessError(TARGET_EXITED.into());
                    let record =
                        RunRecord::new(case.name, case.category, &outcome, Duration::ZERO, clock.now_ms());
                    record_outcome(&mut recorder, &mut summary, &record, &outcome);
                }
                continue;
            }

            let runs = batch.iter().map(|case| {
                let ctx = ctx.clone();
                let timeout = case.timeout.unwrap_or(default_timeout);
                let clock = &clock;
                async move {
                    let started_at = clock.now_ms();
                    info!(case = case.name, "case started");
                    let (outcome, elapsed) = run_case(case, ctx, timeout).await;
                    (started_at, outcome, elapsed)
                }
            });
            let mut results = join_all(runs).await;

            let failed_any = results.iter().any(|(_, outcome, _)| !outcome.is_pass());
            let mut exit = exit_status(&mut target);
            if exit.is_none() && failed_any && !crash_grace.is_zero() {
                tokio::time::sleep(crash_grace).await;
                exit = exit_status(&mut target);
            }
            if let Some(status) = exit {
                warn!(%status, "target exited during the run");
                summary.target_exited = true;
                // Outcomes from a batch the target died in are not evidence
                // either way, passes included.
                for (_, outcome, _) in results.iter_mut() {
                    *outcome =
                        TestOutcome::HarnessError(format!("{TARGET_EXITED} ({status}): {outcome}"));
                }
            }

            for (case, (started_at, outcome, elapsed)) in batch.iter().zip(results) {
                info!(case = case.name, %outcome, ?elapsed, "case finished");
                let record = RunRecord::new(case.name, case.category, &outcome, elapsed, started_at);
                record_outcome(&mut recorder, &mut summary, &record, &outcome);
            }
        }

        self.transition(RunState::Finalizing);
        if let Err(err) = target.stop().await {
            warn!(error = %err, "failed to stop target");
        }
        drop(data_dir);
        summary.elapsed = clock.start.elapsed();
        self.transition(RunState::Done);
        info!(%summary, report = %recorder.path().display(), "run complete");
        Ok(summary)
    }
}

fn exit_status(target: &mut TargetProcess) -> Option<std::process::ExitStatus> {
    target.try_exit_status().unwrap_or_else(|e| {
        warn!(error = %e, "cannot query target status");
        None
    })
}

fn record_outcome(
    recorder: &mut Recorder,
    summary: &mut RunSummary,
    record: &RunRecord,
    outcome: &TestOutcome,
) {
    summary.count(outcome);
    if let Err(err) = recorder.append(record) {
        error!(case = %record.name, error = %err, "failed to record outcome");
        summary.unwritten += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{CaseContext, CaseResult};
    use futures::future::BoxFuture;

    fn body(_: &mut CaseContext) -> BoxFuture<'_, CaseResult> {
        Box::pin(async { Ok(()) })
    }

    fn names(batches: &[Vec<TestCase>]) -> Vec<Vec<&'static str>> {
        batches
            .iter()
            .map(|b| b.iter().map(|c| c.name).collect())
            .collect()
    }

    fn battery() -> Vec<TestCase> {
        vec![
            TestCase::functional("a.1", body),
            TestCase::functional("a.2", body),
            TestCase::functional("a.3", body),
            TestCase::performance("p.1", body),
            TestCase::functional("b.1", body),
            TestCase::performance("p.2", body),
            TestCase::performance("p.3", body),
        ]
    }

    #[test]
    fn serial_schedule_is_one_case_per_batch() {
        let batches = schedule(&battery(), true, 8);
        assert_eq!(batches.len(), 7);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn parallel_schedule_keeps_performance_alone() {
        let batches = schedule(&battery(), false, 2);
        assert_eq!(
            names(&batches),
            vec![
                vec!["a.1", "a.2"],
                vec!["a.3"],
                vec!["p.1"],
                vec!["b.1"],
                vec!["p.2"],
                vec!["p.3"],
            ]
        );
    }

    #[test]
    fn summary_counts() {
        let mut summary = RunSummary::default();
        summary.count(&TestOutcome::Passed);
        summary.count(&TestOutcome::TimedOut);
        summary.count(&TestOutcome::HarnessError(TARGET_EXITED.into()));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.timed_out, 1);
        assert!(!summary.all_passed());
        assert!(summary.to_string().starts_with("3 cases: 1 passed"));
    }

    #[test]
    fn loopback_pool_needs_no_binding() {
        let network = NetworkConfig {
            subnet: "127.0.9.0/29".into(),
            peer_count: 6,
            ..NetworkConfig::default()
        };
        let pool = address_pool(&network).unwrap();
        assert_eq!(pool.capacity(), 6);

        let too_many = NetworkConfig {
            peer_count: 7,
            ..network
        };
        assert!(matches!(
            address_pool(&too_many),
            Err(AllocationError::SubnetTooSmall { .. })
        ));
    }
}
