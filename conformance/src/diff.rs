//! Comparison of two run reports.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::report::{OutcomeKind, ReportError, RunRecord, RunReport};
use crate::testcase::Category;

/// Which tests are checked for duration regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationScope {
    #[default]
    Performance,
    All,
}

/// Differ settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Relative slowdown that counts as a regression (0.2 = 20% slower).
    pub duration_threshold: f64,
    pub duration_scope: DurationScope,
    /// Previous durations below this are too noisy to compare.
    pub min_duration_ms: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            duration_threshold: 0.2,
            duration_scope: DurationScope::Performance,
            min_duration_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("test {name} appears more than once in the {report} report")]
    DuplicateTest { report: &'static str, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Unchanged,
    NewlyFailing,
    NewlyPassing,
    NewlyAbsent,
    NewlyAdded,
    DurationRegressed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::NewlyFailing => "newly-failing",
            Self::NewlyPassing => "newly-passing",
            Self::NewlyAbsent => "newly-absent",
            Self::NewlyAdded => "newly-added",
            Self::DurationRegressed => "duration-regressed",
        }
    }

    pub fn is_regression(&self) -> bool {
        matches!(
            self,
            Self::NewlyFailing | Self::NewlyAbsent | Self::DurationRegressed
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a record a diff entry shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub outcome: OutcomeKind,
    pub duration_ms: u64,
}

impl From<&RunRecord> for Observation {
    fn from(record: &RunRecord) -> Self {
        Self {
            outcome: record.outcome,
            duration_ms: record.duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub name: String,
    pub classification: Classification,
    pub previous: Option<Observation>,
    pub latest: Option<Observation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiffCounts {
    pub unchanged: usize,
    pub newly_failing: usize,
    pub newly_passing: usize,
    pub newly_absent: usize,
    pub newly_added: usize,
    pub duration_regressed: usize,
}

impl DiffCounts {
    fn bump(&mut self, class: Classification) {
        let slot = match class {
            Classification::Unchanged => &mut self.unchanged,
            Classification::NewlyFailing => &mut self.newly_failing,
            Classification::NewlyPassing => &mut self.newly_passing,
            Classification::NewlyAbsent => &mut self.newly_absent,
            Classification::NewlyAdded => &mut self.newly_added,
            Classification::DurationRegressed => &mut self.duration_regressed,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub threshold: f64,
    pub counts: DiffCounts,
    pub entries: Vec<DiffEntry>,
}

impl DiffReport {
    pub fn has_regressions(&self) -> bool {
        self.entries.iter().any(|e| e.classification.is_regression())
    }

    /// Entries other than `unchanged`.
    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|e| e.classification != Classification::Unchanged)
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let write_err = |source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        fs::write(path, json + "\n").map_err(write_err)
    }
}

fn index<'a>(
    report: &'a RunReport,
    which: &'static str,
) -> Result<HashMap<&'a str, &'a RunRecord>, DiffError> {
    let mut map = HashMap::with_capacity(report.len());
    for record in report.iter() {
        if map.insert(record.name.as_str(), record).is_some() {
            return Err(DiffError::DuplicateTest {
                report: which,
                name: record.name.clone(),
            });
        }
    }
    Ok(map)
}

fn classify(previous: &RunRecord, latest: &RunRecord, cfg: &DiffConfig) -> Classification {
    match (previous.is_pass(), latest.is_pass()) {
        (true, false) => return Classification::NewlyFailing,
        (false, true) => return Classification::NewlyPassing,
        (false, false) => return Classification::Unchanged,
        (true, true) => {}
    }

    let in_scope = match cfg.duration_scope {
        DurationScope::All => true,
        DurationScope::Performance => latest.category == Category::Performance,
    };
    if !in_scope || previous.duration_ms < cfg.min_duration_ms {
        return Classification::Unchanged;
    }
    let limit = previous.duration_ms as f64 * (1.0 + cfg.duration_threshold);
    if latest.duration_ms as f64 > limit {
        Classification::DurationRegressed
    } else {
        Classification::Unchanged
    }
}

/// Classify every test seen in either report.
///
/// Entries follow `latest`'s order, then tests only `previous` has, in its
/// order.
pub fn diff(
    previous: &RunReport,
    latest: &RunReport,
    cfg: &DiffConfig,
) -> Result<DiffReport, DiffError> {
    let before = index(previous, "previous")?;
    let after = index(latest, "latest")?;

    let mut counts = DiffCounts::default();
    let mut entries = Vec::with_capacity(before.len().max(after.len()));

    for record in latest.iter() {
        let classification = match before.get(record.name.as_str()) {
            Some(prev) => classify(prev, record, cfg),
            None => Classification::NewlyAdded,
        };
        counts.bump(classification);
        entries.push(DiffEntry {
            name: record.name.clone(),
            classification,
            previous: before.get(record.name.as_str()).map(|r| Observation::from(*r)),
            latest: Some(record.into()),
        });
    }
    for record in previous.iter() {
        if after.contains_key(record.name.as_str()) {
            continue;
        }
        counts.bump(Classification::NewlyAbsent);
        entries.push(DiffEntry {
            name: record.name.clone(),
            classification: Classification::NewlyAbsent,
            previous: Some(record.into()),
            latest: None,
        });
    }

    Ok(DiffReport {
        threshold: cfg.duration_threshold,
        counts,
        entries,
    })
}
