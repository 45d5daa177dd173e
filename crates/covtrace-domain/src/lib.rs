//! Domain logic for covtrace.
//!
//! This crate is intentionally I/O-free: it orders, groups, plans and parses.
//! Subprocesses and the filesystem live in `covtrace-adapters` and `covtrace-app`.

mod grouping;
mod merge_plan;
mod resample;
mod summary;

pub use grouping::{build_timeline, group_events, select_t0, sort_by_mtime, Timeline};
pub use merge_plan::{plan_merge, MergePlan};
pub use resample::{resample, ResampledSample, MAX_GRID_POINTS};
pub use summary::{
    is_no_coverage_data, parse_export_json, parse_report_summary, SummaryParseError,
};

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("bucket width must be a finite number >= 0, got {0}")]
    InvalidBucket(f64),

    #[error("resample step must be a finite number > 0, got {0}")]
    InvalidStep(f64),

    #[error("merge chunk size must be >= 1")]
    InvalidChunkSize,

    #[error("merge requires at least one input profile")]
    EmptyMergeInputs,

    #[error("resampling grid would hold {points} points (limit {limit})")]
    GridTooLarge { points: f64, limit: usize },

    #[error("malformed structured export: {0}")]
    MalformedExport(String),

    #[error(transparent)]
    Summary(#[from] SummaryParseError),
}
