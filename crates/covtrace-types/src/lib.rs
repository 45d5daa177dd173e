//! Shared types for covtrace.
//!
//! Design goal: versioned, explicit, boring.
//! These structs describe the event log, the resampled series, the run
//! receipt and the optional config file.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const TIMELINE_SCHEMA_V1: &str = "covtrace.timeline.v1";

/// Event log written next to the raw profiles.
pub const EVENT_LOG_FILE: &str = "coverage_by_group.csv";
/// Final cumulative profile, moved into place when a run completes.
pub const FINAL_PROFILE_FILE: &str = "coverage.profdata";
pub const RECEIPT_FILE: &str = "summary.json";
pub const TIMED_OUT_LOG_FILE: &str = ".timed_out";
pub const FAILED_LOG_FILE: &str = ".failed";

pub const TIMESTAMP_COLUMN: &str = "timestamp_iso";
pub const ELAPSED_COLUMN: &str = "elapsed_sec";
pub const ELAPSED_HOURS_COLUMN: &str = "elapsed_hours";

/// The five coverage metric kinds reported by the exporter.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum CoverageKind {
    Function,
    Line,
    Region,
    Branch,
    Instantiation,
}

impl CoverageKind {
    /// Every kind, in event-log column order.
    pub const ALL: [CoverageKind; 5] = [
        CoverageKind::Function,
        CoverageKind::Line,
        CoverageKind::Region,
        CoverageKind::Branch,
        CoverageKind::Instantiation,
    ];

    /// Column prefix in the event log (`func_covered`, `inst_total`, ...).
    pub fn column_prefix(self) -> &'static str {
        match self {
            CoverageKind::Function => "func",
            CoverageKind::Line => "line",
            CoverageKind::Region => "region",
            CoverageKind::Branch => "branch",
            CoverageKind::Instantiation => "inst",
        }
    }

    /// Stem of the resampled per-kind file (`function_coverage.csv`).
    pub fn series_name(self) -> &'static str {
        match self {
            CoverageKind::Function => "function",
            CoverageKind::Line => "line",
            CoverageKind::Region => "region",
            CoverageKind::Branch => "branch",
            CoverageKind::Instantiation => "inst",
        }
    }

    /// Key under `data[0].totals` in the structured export.
    pub fn export_key(self) -> &'static str {
        match self {
            CoverageKind::Function => "functions",
            CoverageKind::Line => "lines",
            CoverageKind::Region => "regions",
            CoverageKind::Branch => "branches",
            CoverageKind::Instantiation => "instantiations",
        }
    }

    /// Column header in the textual summary report.
    pub fn report_column(self) -> &'static str {
        match self {
            CoverageKind::Function => "Function Coverage",
            CoverageKind::Line => "Line Coverage",
            CoverageKind::Region => "Region Coverage",
            CoverageKind::Branch => "Branch Coverage",
            CoverageKind::Instantiation => "Instantiation Coverage",
        }
    }

    pub fn covered_column(self) -> String {
        format!("{}_covered", self.column_prefix())
    }

    pub fn total_column(self) -> String {
        format!("{}_total", self.column_prefix())
    }

    pub fn percent_column(self) -> String {
        format!("{}_percent", self.column_prefix())
    }

    pub fn series_file_name(self) -> String {
        format!("{}_coverage.csv", self.series_name())
    }
}

/// Full event-log header, in column order.
pub fn event_log_columns() -> Vec<String> {
    let mut cols = vec![TIMESTAMP_COLUMN.to_string(), ELAPSED_COLUMN.to_string()];
    for kind in CoverageKind::ALL {
        cols.push(kind.covered_column());
        cols.push(kind.total_column());
        cols.push(kind.percent_column());
    }
    cols
}

/// `"A_data"` and `".A_data"` both become `".A_data"`; empty stays empty.
pub fn normalize_suffix(suffix: &str) -> String {
    let s = suffix.trim();
    if s.is_empty() || s.starts_with('.') {
        s.to_string()
    } else {
        format!(".{s}")
    }
}

/// Full artifact file pattern: base pattern plus normalized suffix.
pub fn artifact_pattern(base: &str, suffix: &str) -> String {
    format!("{base}{}", normalize_suffix(suffix))
}

/// One `(covered, total, percent)` triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct MetricTotals {
    pub covered: u64,
    pub total: u64,

    /// Percentage in `[0, 100]`.
    pub percent: f64,
}

impl MetricTotals {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a triple whose percentage is derived from the counts.
    /// A zero denominator yields 0%.
    pub fn from_counts(covered: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            100.0 * covered as f64 / total as f64
        };
        Self {
            covered,
            total,
            percent,
        }
    }
}

/// Totals for every coverage kind, always recomputed from a merged profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct CoverageTotals {
    pub functions: MetricTotals,
    pub lines: MetricTotals,
    pub regions: MetricTotals,
    pub branches: MetricTotals,
    pub instantiations: MetricTotals,
}

impl CoverageTotals {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: CoverageKind) -> &MetricTotals {
        match kind {
            CoverageKind::Function => &self.functions,
            CoverageKind::Line => &self.lines,
            CoverageKind::Region => &self.regions,
            CoverageKind::Branch => &self.branches,
            CoverageKind::Instantiation => &self.instantiations,
        }
    }

    pub fn get_mut(&mut self, kind: CoverageKind) -> &mut MetricTotals {
        match kind {
            CoverageKind::Function => &mut self.functions,
            CoverageKind::Line => &mut self.lines,
            CoverageKind::Region => &mut self.regions,
            CoverageKind::Branch => &mut self.branches,
            CoverageKind::Instantiation => &mut self.instantiations,
        }
    }

    /// Baseline view: nothing covered, denominators kept.
    pub fn baseline(&self) -> Self {
        let mut out = *self;
        for kind in CoverageKind::ALL {
            let m = out.get_mut(kind);
            m.covered = 0;
            m.percent = 0.0;
        }
        out
    }
}

/// A recorded input found in the corpus directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TestArtifact {
    pub path: PathBuf,

    /// Modification time, seconds since the UNIX epoch.
    pub mtime: f64,
}

impl TestArtifact {
    pub fn new(path: impl Into<PathBuf>, mtime: f64) -> Self {
        Self {
            path: path.into(),
            mtime,
        }
    }

    /// File name used to key raw profiles and sidecar entries.
    pub fn name(&self) -> String {
        file_name_lossy(&self.path)
    }
}

fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Unit of replay-and-merge work.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Elapsed seconds since `t0` (the bucket key when bucketing).
    pub elapsed_sec: f64,
    pub artifacts: Vec<TestArtifact>,
}

/// One row of the event log.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct EventRecord {
    pub timestamp_iso: String,
    pub elapsed_sec: f64,
    pub totals: CoverageTotals,
}

/// Outcome of replaying a single artifact. None of these are fatal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ReplayStatus {
    Succeeded,
    TimedOut,
    Failed { exit_code: i32 },
}

/// How the resampling grid ends.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum GridEnd {
    /// `0, step, ..., ceil(max / step) * step`.
    #[default]
    Ceil,

    /// `0, step, ..., floor(max / step) * step`, plus one sample at the true
    /// last elapsed time when it is off-grid.
    LastSample,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown grid end {0:?} (expected ceil|last-sample)")]
pub struct UnknownGridEnd(pub String);

impl FromStr for GridEnd {
    type Err = UnknownGridEnd;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ceil" => Ok(GridEnd::Ceil),
            "last-sample" | "last_sample" => Ok(GridEnd::LastSample),
            other => Err(UnknownGridEnd(other.to_string())),
        }
    }
}

// ----------------------------
// Run receipt
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RunMeta {
    pub started_at: String,
    pub ended_at: String,
}

/// Monotonic replay counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct ReplayCounts {
    pub replayed: u64,
    pub timed_out: u64,
    pub failed: u64,
}

impl ReplayCounts {
    pub fn record(&mut self, status: ReplayStatus) {
        self.replayed += 1;
        match status {
            ReplayStatus::Succeeded => {}
            ReplayStatus::TimedOut => self.timed_out += 1,
            ReplayStatus::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct TimelineOutputs {
    pub event_log: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resampled: Vec<String>,
}

/// Summary written at the end of (or after interrupting) a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TimelineReceipt {
    pub schema: String,
    pub tool: ToolInfo,
    pub run: RunMeta,
    pub corpus: String,
    pub target: String,
    pub t0: String,
    pub artifacts: u64,
    pub events: u64,
    pub events_merged: u64,
    pub events_skipped: u64,
    pub counts: ReplayCounts,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_totals: Option<CoverageTotals>,

    #[serde(default)]
    pub interrupted: bool,

    pub outputs: TimelineOutputs,
}

// ----------------------------
// Optional config file schema
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

/// A duration in the config file: bare seconds (`15`, `1.5`) or a humantime
/// string (`"20m"`, `"1h 30m"`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(f64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus: Option<String>,

    /// Event bucket width in seconds; 0 = one event per artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_sec: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationSetting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_after: Option<DurationSetting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_chunk_size: Option<usize>,

    /// Merge threads; 0 = CPU count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_threads: Option<usize>,

    /// Parallel replays within one event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resample_step: Option<DurationSetting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_end: Option<GridEnd>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_early: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_resample: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resample_out: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_suffix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_start_marker: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_no_exec: Option<bool>,

    /// Extra environment for replays.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cov: Option<String>,
}
