//! Conformance tests using libtest-mimic.
//!
//! Every declared case runs against the bundled mock target, which is
//! expected to pass all of them. Each trial starts its own mock target on a
//! free port and draws its synthetic peers from its own loopback subnet, so
//! trials can run in parallel.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledger_conformance::config::NetworkConfig;
use ledger_conformance::engine::{Registry, run_case};
use ledger_conformance::orchestrator::address_pool;
use ledger_conformance::target::{Backoff, TargetLaunch, TargetProcess, free_port};
use ledger_conformance::testcase::{CaseContext, TestCase, TestOutcome};
use libtest_mimic::{Arguments, Failed, Trial};
use owo_colors::OwoColorize;

const MAX_PEERS: usize = 8;
const CASE_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    let args = Arguments::from_args();
    ledger_conformance::try_init_tracing("warn");

    let bin = PathBuf::from(env!("CARGO_BIN_EXE_ledger-mock-target"));
    let trials: Vec<Trial> = Registry::declared()
        .iter()
        .enumerate()
        .map(|(index, case)| {
            let case = *case;
            let bin = bin.clone();
            Trial::test(case.name, move || run_test(&bin, case, index))
                .with_kind(case.category.as_str())
        })
        .collect();

    libtest_mimic::run(&args, trials).exit();
}

fn run_test(bin: &Path, case: TestCase, index: usize) -> Result<(), Failed> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to create runtime: {}", e))?;

    rt.block_on(run_test_async(bin, case, index))
}

async fn run_test_async(bin: &Path, case: TestCase, index: usize) -> Result<(), Failed> {
    let start = Instant::now();

    // 127.40.0.0/24, 127.41.0.0/24, ...: one subnet per trial.
    let network = NetworkConfig {
        subnet: format!("127.{}.0.0/24", 40 + index),
        peer_count: 48,
        ..NetworkConfig::default()
    };
    let pool = address_pool(&network).map_err(|e| format!("address pool: {}", e))?;
    let seed = Arc::new(pool.checkout().map_err(|e| e.to_string())?);
    let seed_port = free_port(seed.addr()).map_err(|e| format!("seed port: {}", e))?;

    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let listen = SocketAddr::new(
        localhost,
        free_port(localhost).map_err(|e| format!("listen port: {}", e))?,
    );
    let data_dir = tempfile::tempdir().map_err(|e| format!("data dir: {}", e))?;

    let launch = TargetLaunch {
        binary: bin.to_path_buf(),
        args: Vec::new(),
        env: BTreeMap::new(),
        listen,
        data_dir: data_dir.path().to_path_buf(),
        peers: vec![SocketAddr::new(seed.addr(), seed_port)],
        max_peers: MAX_PEERS,
        relay_output: false,
    };
    let mut target = TargetProcess::spawn(&launch)?;
    target
        .wait_ready(Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(500),
            attempts: 40,
        })
        .await?;

    let mut ctx = CaseContext::new(listen, pool).with_seeds(vec![seed], seed_port);
    ctx.max_peers = MAX_PEERS;
    ctx.quiet_period = Duration::from_millis(500);

    let (outcome, elapsed) = run_case(&case, ctx, case.timeout.unwrap_or(CASE_TIMEOUT)).await;
    let exited = target.has_exited();
    let _ = target.stop().await;

    eprintln!(
        "{:>8.5}s {} {} {} in {:?}",
        start.elapsed().as_secs_f64(),
        "[harn]".cyan(),
        case.name,
        outcome,
        elapsed
    );

    if exited {
        return Err(Failed::from(format!(
            "mock target exited during {}",
            case.name
        )));
    }
    match outcome {
        TestOutcome::Passed => Ok(()),
        other => Err(Failed::from(format!("{} after {:?}", other, elapsed))),
    }
}
