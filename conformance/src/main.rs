//! Ledger node conformance harness.
//!
//! # Usage
//!
//! Run the whole battery against a node:
//! ```bash
//! ledger-conformance run --target ./ledger-node
//! ```
//!
//! Run one group, concurrently, for a quick local check:
//! ```bash
//! ledger-conformance run --target ./ledger-node --case handshake --parallel
//! ```
//!
//! List test cases:
//! ```bash
//! ledger-conformance list --category performance --format json
//! ```
//!
//! Compare the last two runs:
//! ```bash
//! ledger-conformance diff --fail-on-regression
//! ```
//!
//! # Exit Codes
//!
//! - 0: Every case passed (or no regressions)
//! - 1: Some case did not pass (or a regression with `--fail-on-regression`)
//! - 2: The harness could not run

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use ledger_conformance::config::HarnessConfig;
use ledger_conformance::diff::{Classification, DiffEntry, DurationScope, Observation, diff};
use ledger_conformance::engine::Registry;
use ledger_conformance::orchestrator::{Orchestrator, address_pool};
use ledger_conformance::pool::{
    InterfaceBinder, IpCommandBinder, NoopBinder, Subnet, allocate, write_address_list,
};
use ledger_conformance::report::{load_report, rotate_reports};
use ledger_conformance::testcase::Category;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "ledger-conformance", version)]
#[command(about = "Protocol conformance and performance harness for ledger peer nodes")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the target and run the test battery against it
    Run(RunArgs),
    /// List available test cases
    List(ListArgs),
    /// Compare the previous and latest run reports
    Diff(DiffArgs),
    /// Allocate peer addresses and save them as an address list
    Allocate(AllocateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Target binary
    #[arg(long)]
    target: Option<PathBuf>,

    /// Address the target listens on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Per-case timeout in milliseconds
    #[arg(long)]
    case_timeout_ms: Option<u64>,

    /// Latest report path
    #[arg(long)]
    latest: Option<PathBuf>,

    /// Previous report path (the latest report is moved here first)
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Run functional cases concurrently (development only)
    #[arg(long)]
    parallel: bool,

    /// Only run these cases or groups (repeatable)
    #[arg(long = "case")]
    cases: Vec<String>,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Filter by category (functional, performance)
    #[arg(long)]
    category: Option<String>,

    /// Filter by group or case name
    #[arg(long)]
    group: Option<String>,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: String,
}

#[derive(Args, Debug)]
struct DiffArgs {
    #[arg(long)]
    previous: Option<PathBuf>,

    #[arg(long)]
    latest: Option<PathBuf>,

    /// Where the diff JSON is written
    #[arg(long)]
    output: Option<PathBuf>,

    /// Relative slowdown that counts as a regression
    #[arg(long)]
    threshold: Option<f64>,

    /// Compare durations of all tests, not only performance tests
    #[arg(long)]
    all_durations: bool,

    /// Exit with status 1 when anything regressed
    #[arg(long)]
    fail_on_regression: bool,
}

#[derive(Args, Debug)]
struct AllocateArgs {
    #[arg(long)]
    subnet: Option<String>,

    #[arg(long)]
    interface: Option<String>,

    #[arg(long)]
    count: Option<usize>,

    /// Address list output path
    #[arg(long)]
    output: Option<PathBuf>,
}

/// JSON output for a test case listing.
#[derive(Serialize)]
struct TestCaseJson {
    name: &'static str,
    category: Category,
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    ledger_conformance::try_init_tracing("info");
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HarnessConfig::load(path),
        None => Ok(HarnessConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::List(args) => list(&args),
        Command::Diff(args) => diff_reports(config, args),
        Command::Allocate(args) => allocate_addresses(config, args),
    }
}

async fn run(mut config: HarnessConfig, args: RunArgs) -> ExitCode {
    if let Some(target) = args.target {
        config.target.binary = Some(target);
    }
    if let Some(listen) = args.listen {
        config.target.listen = listen;
    }
    if let Some(ms) = args.case_timeout_ms {
        config.run.case_timeout_ms = ms;
    }
    if let Some(latest) = args.latest {
        config.reports.latest = latest;
    }
    if let Some(previous) = args.previous {
        config.reports.previous = previous;
    }
    if args.parallel {
        config.run.serial = false;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    let registry = Registry::declared().select(&args.cases);
    if registry.is_empty() {
        error!(filters = ?args.cases, "no test case matches");
        return ExitCode::from(2);
    }

    if let Err(e) = rotate_reports(&config.reports.latest, &config.reports.previous) {
        error!(error = %e, "failed to rotate reports");
        return ExitCode::from(2);
    }
    let pool = match address_pool(&config.network) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to prepare peer addresses");
            return ExitCode::from(2);
        }
    };

    let mut orchestrator = Orchestrator::new(config, registry, pool);
    match orchestrator.run().await {
        Ok(summary) => {
            if summary.all_passed() {
                eprintln!("{} {summary}", "PASS".green());
                ExitCode::SUCCESS
            } else {
                eprintln!("{} {summary}", "FAIL".red());
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            ExitCode::from(2)
        }
    }
}

fn list(args: &ListArgs) -> ExitCode {
    let mut registry = Registry::declared();
    if let Some(group) = &args.group {
        registry = registry.filter(group);
    }
    let cases: Vec<_> = registry
        .iter()
        .filter(|c| {
            args.category
                .as_deref()
                .is_none_or(|category| c.category.as_str() == category)
        })
        .collect();

    if args.format == "json" {
        let output: Vec<TestCaseJson> = cases
            .iter()
            .map(|c| TestCaseJson {
                name: c.name,
                category: c.category,
                timeout_ms: c
                    .timeout
                    .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect();
        match serde_json::to_string(&output) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!(error = %e, "failed to encode listing");
                return ExitCode::from(2);
            }
        }
        return ExitCode::SUCCESS;
    }

    println!("Available test cases:\n");
    let mut current_group = "";
    for case in &cases {
        let group = case.group();
        if group != current_group {
            if !current_group.is_empty() {
                println!();
            }
            println!("## {group}");
            current_group = group;
        }
        match case.category {
            Category::Functional => println!("  {}", case.name),
            Category::Performance => println!("  {} [{}]", case.name, case.category),
        }
    }
    println!("\nTotal: {} tests", cases.len());
    ExitCode::SUCCESS
}

fn diff_reports(config: HarnessConfig, args: DiffArgs) -> ExitCode {
    let previous_path = args.previous.unwrap_or(config.reports.previous);
    let latest_path = args.latest.unwrap_or(config.reports.latest);
    let output = args.output.unwrap_or(config.reports.diff);
    let mut cfg = config.diff;
    if let Some(threshold) = args.threshold {
        cfg.duration_threshold = threshold;
    }
    if args.all_durations {
        cfg.duration_scope = DurationScope::All;
    }

    let load = |path: &Path| {
        load_report(path).inspect_err(|e| error!(error = %e, "cannot load report"))
    };
    let (Ok(previous), Ok(latest)) = (load(&previous_path), load(&latest_path)) else {
        return ExitCode::from(2);
    };

    let report = match diff(&previous, &latest, &cfg) {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "cannot diff reports");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = report.write(&output) {
        error!(error = %e, "cannot write diff");
        return ExitCode::from(2);
    }

    for entry in report.changes() {
        eprintln!("{}", describe(entry));
    }
    let counts = &report.counts;
    eprintln!(
        "{} unchanged, {} newly failing, {} newly passing, {} newly absent, {} newly added, {} slower (diff written to {})",
        counts.unchanged,
        counts.newly_failing,
        counts.newly_passing,
        counts.newly_absent,
        counts.newly_added,
        counts.duration_regressed,
        output.display()
    );

    if args.fail_on_regression && report.has_regressions() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn describe(entry: &DiffEntry) -> String {
    let label = format!("{:<18}", entry.classification.as_str());
    let label = match entry.classification {
        Classification::NewlyFailing
        | Classification::NewlyAbsent
        | Classification::DurationRegressed => label.red().to_string(),
        Classification::NewlyPassing => label.green().to_string(),
        Classification::NewlyAdded => label.cyan().to_string(),
        Classification::Unchanged => label,
    };
    let side = |obs: Option<Observation>| match obs {
        Some(obs) => format!("{} {}ms", obs.outcome.as_str(), obs.duration_ms),
        None => "-".to_string(),
    };
    format!(
        "{label} {} ({} -> {})",
        entry.name,
        side(entry.previous),
        side(entry.latest)
    )
}

fn allocate_addresses(config: HarnessConfig, args: AllocateArgs) -> ExitCode {
    let network = config.network;
    let subnet_text = args.subnet.unwrap_or(network.subnet);
    let interface = args.interface.unwrap_or(network.interface);
    let count = args.count.unwrap_or(network.peer_count);
    let Some(output) = args.output.or(network.address_list) else {
        error!("no output path: pass --output or set network.address_list");
        return ExitCode::from(2);
    };

    let result = subnet_text.parse::<Subnet>().and_then(|subnet| {
        let binder: &dyn InterfaceBinder = if subnet.is_loopback() {
            &NoopBinder
        } else {
            &IpCommandBinder
        };
        let addrs = allocate(&subnet, count, &interface, binder)?;
        write_address_list(&output, &addrs)?;
        Ok(addrs.len())
    });
    match result {
        Ok(n) => {
            eprintln!("wrote {n} addresses to {}", output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "address allocation failed");
            ExitCode::from(2)
        }
    }
}
