//! Run reports: one JSON object per line, one line per executed case.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::testcase::{Category, TestOutcome};

/// Errors reading or writing report files.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create report {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: malformed record: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to move {from} to {to}: {source}")]
    Rotate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome without its reason, as stored in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Passed,
    Failed,
    TimedOut,
    HarnessError,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::HarnessError => "harness_error",
        }
    }
}

impl From<&TestOutcome> for OutcomeKind {
    fn from(outcome: &TestOutcome) -> Self {
        match outcome {
            TestOutcome::Passed => Self::Passed,
            TestOutcome::Failed(_) => Self::Failed,
            TestOutcome::TimedOut => Self::TimedOut,
            TestOutcome::HarnessError(_) => Self::HarnessError,
        }
    }
}

/// One executed case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub category: Category,
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub reason: Option<String>,
    pub duration_ms: u64,
    /// Milliseconds since the Unix epoch when the case started.
    pub started_at_ms: u64,
}

impl RunRecord {
    pub fn new(
        name: impl Into<String>,
        category: Category,
        outcome: &TestOutcome,
        duration: Duration,
        started_at_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            outcome: outcome.into(),
            reason: outcome.reason().map(str::to_owned),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            started_at_ms,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.outcome == OutcomeKind::Passed
    }
}

/// A loaded report, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub records: Vec<RunRecord>,
}

impl RunReport {
    pub fn get(&self, name: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<RunRecord> for RunReport {
    fn from_iter<I: IntoIterator<Item = RunRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Append-only writer for the latest report.
pub struct Recorder {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .field("written", &self.written)
            .finish()
    }
}

impl Recorder {
    /// Create (or truncate) the report at `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self, ReportError> {
        let create_err = |source| ReportError::Create {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(create_err)?;
        }
        let file = File::create(path).map_err(create_err)?;
        debug!(path = %path.display(), "report created");
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// Write one record and flush it to disk.
    pub fn append(&mut self, record: &RunRecord) -> Result<(), ReportError> {
        let write = |out: &mut BufWriter<File>| -> io::Result<()> {
            serde_json::to_writer(&mut *out, record)?;
            out.write_all(b"\n")?;
            out.flush()
        };
        write(&mut self.out).map_err(|source| ReportError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

/// Move `latest` to `previous` if it exists. Returns whether a report moved.
pub fn rotate_reports(latest: &Path, previous: &Path) -> Result<bool, ReportError> {
    if !latest.exists() {
        return Ok(false);
    }
    let rotate_err = |source| ReportError::Rotate {
        from: latest.to_path_buf(),
        to: previous.to_path_buf(),
        source,
    };
    if let Some(parent) = previous.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(rotate_err)?;
    }
    if fs::rename(latest, previous).is_err() {
        // Across filesystems rename fails; fall back to copy and remove.
        fs::copy(latest, previous).map_err(rotate_err)?;
        fs::remove_file(latest).map_err(rotate_err)?;
    }
    info!(from = %latest.display(), to = %previous.display(), "rotated report");
    Ok(true)
}

/// Parse a JSON-lines report. Blank lines are skipped.
pub fn load_report(path: &Path) -> Result<RunReport, ReportError> {
    let read_err = |source| ReportError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(read_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| ReportError::Parse {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(RunReport { records })
}
