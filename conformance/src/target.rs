//! The node under test as a child process.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variables every target receives.
pub const ENV_LISTEN: &str = "LEDGER_TARGET_LISTEN";
pub const ENV_DATA_DIR: &str = "LEDGER_TARGET_DATA_DIR";
pub const ENV_PEERS: &str = "LEDGER_TARGET_PEERS";
pub const ENV_MAX_PEERS: &str = "LEDGER_TARGET_MAX_PEERS";

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target did not accept connections on {addr} after {attempts} attempts")]
    Unresponsive { addr: SocketAddr, attempts: u32 },

    #[error("target exited while starting ({status})")]
    Exited { status: ExitStatus },

    #[error("target process: {0}")]
    Io(#[from] io::Error),
}

/// Lower bound on a single readiness connect.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything needed to launch a target.
#[derive(Debug, Clone)]
pub struct TargetLaunch {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub peers: Vec<SocketAddr>,
    pub max_peers: usize,
    pub relay_output: bool,
}

impl TargetLaunch {
    fn peer_list(&self) -> String {
        self.peers
            .iter()
            .map(SocketAddr::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Arguments with placeholders filled in.
    pub fn expanded_args(&self) -> Vec<String> {
        let peers = self.peer_list();
        let data_dir = self.data_dir.display().to_string();
        let listen = self.listen.to_string();
        let max_peers = self.max_peers.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{listen}", &listen)
                    .replace("{data_dir}", &data_dir)
                    .replace("{peers}", &peers)
                    .replace("{max_peers}", &max_peers)
            })
            .collect()
    }
}

/// Readiness probing schedule: `attempts` connects, doubling the wait
/// between them from `initial` up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

/// A running target.
pub struct TargetProcess {
    child: Child,
    listen: SocketAddr,
    relays: Vec<JoinHandle<()>>,
    started: Instant,
    exited: Option<ExitStatus>,
}

impl std::fmt::Debug for TargetProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetProcess")
            .field("pid", &self.child.id())
            .field("listen", &self.listen)
            .field("exited", &self.exited)
            .finish()
    }
}

impl TargetProcess {
    pub fn spawn(launch: &TargetLaunch) -> Result<Self, TargetError> {
        let args = launch.expanded_args();
        info!(
            binary = %launch.binary.display(),
            ?args,
            listen = %launch.listen,
            "starting target"
        );

        let output = || {
            if launch.relay_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        let mut child = Command::new(&launch.binary)
            .args(&args)
            .envs(&launch.env)
            .env(ENV_LISTEN, launch.listen.to_string())
            .env(ENV_DATA_DIR, &launch.data_dir)
            .env(ENV_PEERS, launch.peer_list())
            .env(ENV_MAX_PEERS, launch.max_peers.to_string())
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TargetError::Spawn {
                binary: launch.binary.clone(),
                source,
            })?;

        let started = Instant::now();
        let mut relays = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            relays.push(tokio::spawn(relay_lines(stdout, started)));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(tokio::spawn(relay_lines(stderr, started)));
        }

        Ok(Self {
            child,
            listen: launch.listen,
            relays,
            started,
            exited: None,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Probe the listen address until it accepts a TCP connection.
    pub async fn wait_ready(&mut self, backoff: Backoff) -> Result<(), TargetError> {
        let mut delay = backoff.initial;
        for attempt in 1..=backoff.attempts {
            if let Some(status) = self.try_exit_status()? {
                return Err(TargetError::Exited { status });
            }
            let probe =
                tokio::time::timeout(delay.max(PROBE_TIMEOUT), TcpStream::connect(self.listen))
                    .await;
            match probe {
                Ok(Ok(_stream)) => {
                    info!(attempt, uptime = ?self.uptime(), "target ready");
                    return Ok(());
                }
                Ok(Err(e)) => debug!(attempt, error = %e, "target not ready"),
                Err(_) => debug!(attempt, "readiness probe timed out"),
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(backoff.max);
        }
        if let Some(status) = self.try_exit_status()? {
            return Err(TargetError::Exited { status });
        }
        Err(TargetError::Unresponsive {
            addr: self.listen,
            attempts: backoff.attempts,
        })
    }

    /// Exit status if the process has exited.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait()?;
        }
        Ok(self.exited)
    }

    pub fn has_exited(&mut self) -> bool {
        match self.try_exit_status() {
            Ok(status) => status.is_some(),
            Err(e) => {
                warn!(error = %e, "cannot query target status");
                false
            }
        }
    }

    /// Kill the process (if still running) and wait for it and its relays.
    pub async fn stop(mut self) -> Result<ExitStatus, TargetError> {
        let status = match self.try_exit_status()? {
            Some(status) => status,
            None => {
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        // Descendants may keep the pipes open; do not wait on them for long.
        for relay in self.relays.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), relay).await;
        }
        info!(%status, uptime = ?self.uptime(), "target stopped");
        Ok(status)
    }
}

/// Seconds since `start`, right-aligned for relayed log lines.
fn format_uptime(start: Instant) -> String {
    let elapsed = start.elapsed();
    format!("{:>8.5}s", elapsed.as_secs_f64())
}

/// Copy target output to stderr, one prefixed line at a time.
async fn relay_lines<R: tokio::io::AsyncRead + Unpin>(reader: R, start: Instant) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        eprintln!("{} {} {}", format_uptime(start), "[node]".yellow(), line);
    }
}

/// Free TCP port on `ip`, for tests that start their own targets.
pub fn free_port(ip: std::net::IpAddr) -> io::Result<u16> {
    let listener = std::net::TcpListener::bind(SocketAddr::new(ip, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Path of a sibling binary of the current executable.
pub fn sibling_binary(name: &str) -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let mut dir = exe
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("executable has no parent directory"))?;
    if dir.ends_with("deps") {
        dir.pop();
    }
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(args: &[&str]) -> TargetLaunch {
        TargetLaunch {
            binary: PathBuf::from("/bin/sh"),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            listen: "127.0.0.1:51235".parse().unwrap(),
            data_dir: PathBuf::from("/tmp/node"),
            peers: vec![
                "127.0.1.1:51236".parse().unwrap(),
                "127.0.1.2:51236".parse().unwrap(),
            ],
            max_peers: 8,
            relay_output: false,
        }
    }

    #[test]
    fn placeholders_expand() {
        let l = launch(&[
            "--listen={listen}",
            "--db",
            "{data_dir}/db",
            "--peers={peers}",
            "--max={max_peers}",
            "{unknown}",
        ]);
        assert_eq!(
            l.expanded_args(),
            [
                "--listen=127.0.0.1:51235",
                "--db",
                "/tmp/node/db",
                "--peers=127.0.1.1:51236,127.0.1.2:51236",
                "--max=8",
                "{unknown}",
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let mut l = launch(&[]);
        l.binary = PathBuf::from("/nonexistent/ledger-node");
        assert!(matches!(
            TargetProcess::spawn(&l),
            Err(TargetError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let mut l = launch(&["-c", "exit 3"]);
        l.listen = SocketAddr::new([127, 0, 0, 1].into(), free_port([127, 0, 0, 1].into()).unwrap());
        let mut target = TargetProcess::spawn(&l).unwrap();
        let backoff = Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            attempts: 30,
        };
        match target.wait_ready(backoff).await {
            Err(TargetError::Exited { status }) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_process_is_unresponsive() {
        let mut l = launch(&["-c", "sleep 30"]);
        l.listen = SocketAddr::new([127, 0, 0, 1].into(), free_port([127, 0, 0, 1].into()).unwrap());
        let mut target = TargetProcess::spawn(&l).unwrap();
        let backoff = Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            attempts: 3,
        };
        assert!(matches!(
            target.wait_ready(backoff).await,
            Err(TargetError::Unresponsive { attempts: 3, .. })
        ));
        assert!(!target.has_exited());
        target.stop().await.unwrap();
    }
}
