//! Harness configuration.
//!
//! One TOML file with a section per concern. Every field has a default, so an
//! empty file (or no file at all) describes a loopback run against a target
//! listening on [`DEFAULT_TARGET_LISTEN`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diff::DiffConfig;

/// Default address the target listens on.
pub const DEFAULT_TARGET_LISTEN: &str = "127.0.0.1:51235";

/// Default peer limit passed to the target.
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Default subnet synthetic peers are drawn from.
pub const DEFAULT_SUBNET: &str = "127.0.1.0/24";

/// Default interface addresses are bound on.
pub const DEFAULT_INTERFACE: &str = "lo";

/// Default number of synthetic peer addresses.
pub const DEFAULT_PEER_COUNT: usize = 64;

/// Default port seed listeners bind on.
pub const DEFAULT_SEED_PORT: u16 = 51236;

/// Default per-case timeout.
pub const DEFAULT_CASE_TIMEOUT_MS: u64 = 30_000;

/// Default report locations.
pub const DEFAULT_LATEST_REPORT: &str = "reports/latest.jsonl";
pub const DEFAULT_PREVIOUS_REPORT: &str = "reports/previous.jsonl";
pub const DEFAULT_DIFF_REPORT: &str = "reports/diff.json";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration.
    #[error("failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub target: TargetConfig,
    pub network: NetworkConfig,
    pub run: RunConfig,
    pub reports: ReportsConfig,
    pub diff: DiffConfig,
}

impl HarnessConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.parallelism == 0 {
            return Err(ConfigError::Invalid("run.parallelism must be at least 1".into()));
        }
        if self.target.start_attempts == 0 {
            return Err(ConfigError::Invalid(
                "target.start_attempts must be at least 1".into(),
            ));
        }
        if !self.diff.duration_threshold.is_finite() || self.diff.duration_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "diff.duration_threshold must be a non-negative number, got {}",
                self.diff.duration_threshold
            )));
        }
        let reserved = self.network.seed_peers + self.target.max_peers;
        if self.network.address_list.is_none() && self.network.peer_count <= self.network.seed_peers
        {
            return Err(ConfigError::Invalid(format!(
                "network.peer_count ({}) leaves no addresses after {} seed peers",
                self.network.peer_count, self.network.seed_peers
            )));
        }
        if self.network.peer_count < reserved {
            tracing::warn!(
                peer_count = self.network.peer_count,
                max_peers = self.target.max_peers,
                "fewer addresses than the target's peer limit; load cases will report a harness error"
            );
        }
        Ok(())
    }
}

/// The node under test and how it is started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    /// Path of the target binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    /// Arguments, with `{listen}`, `{data_dir}`, `{peers}` and `{max_peers}`
    /// replaced before launch.
    pub args: Vec<String>,

    /// Extra environment for the target.
    pub env: BTreeMap<String, String>,

    pub listen: SocketAddr,
    pub max_peers: usize,

    /// Relay the target's stdout and stderr with a prefix.
    pub relay_output: bool,

    pub start_backoff_ms: u64,
    pub start_backoff_max_ms: u64,
    pub start_attempts: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            listen: default_listen(),
            max_peers: DEFAULT_MAX_PEERS,
            relay_output: true,
            start_backoff_ms: 50,
            start_backoff_max_ms: 2_000,
            start_attempts: 20,
        }
    }
}

impl TargetConfig {
    pub fn start_backoff(&self) -> Duration {
        Duration::from_millis(self.start_backoff_ms)
    }

    pub fn start_backoff_max(&self) -> Duration {
        Duration::from_millis(self.start_backoff_max_ms)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 51235))
}

/// Where synthetic peer addresses come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub subnet: String,
    pub interface: String,
    pub peer_count: usize,

    /// Pre-allocated address list; used instead of `subnet` when it exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_list: Option<PathBuf>,

    /// Pool addresses handed to the target as its initial peers.
    pub seed_peers: usize,
    pub seed_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: DEFAULT_SUBNET.to_string(),
            interface: DEFAULT_INTERFACE.to_string(),
            peer_count: DEFAULT_PEER_COUNT,
            address_list: None,
            seed_peers: 1,
            seed_port: DEFAULT_SEED_PORT,
        }
    }
}

/// Timeouts and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub case_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub quiet_period_ms: u64,
    /// How long to wait for a target that may be dying after a failed case.
    pub crash_grace_ms: u64,
    /// Run one case at a time. Turning this off is a development shortcut.
    pub serial: bool,
    /// Upper bound on concurrently running functional cases when not serial.
    pub parallelism: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            case_timeout_ms: DEFAULT_CASE_TIMEOUT_MS,
            recv_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            quiet_period_ms: 1_000,
            crash_grace_ms: 200,
            serial: true,
            parallelism: 4,
        }
    }
}

impl RunConfig {
    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn crash_grace(&self) -> Duration {
        Duration::from_millis(self.crash_grace_ms)
    }
}

/// Report file locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportsConfig {
    pub latest: PathBuf,
    pub previous: PathBuf,
    pub diff: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            latest: PathBuf::from(DEFAULT_LATEST_REPORT),
            previous: PathBuf::from(DEFAULT_PREVIOUS_REPORT),
            diff: PathBuf::from(DEFAULT_DIFF_REPORT),
        }
    }
}
