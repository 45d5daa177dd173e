//! Parsing of the coverage exporter's two output shapes.
//!
//! The structured export is JSON with per-kind totals under `data[0].totals`.
//! The textual report is a whitespace-aligned table whose `TOTAL` row holds
//! `covered/total percent%` cells.

use crate::DomainError;
use covtrace_types::{CoverageKind, CoverageTotals, MetricTotals};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static COLUMN_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static COUNTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*/\s*(\d+)").unwrap());
static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap());

const NO_DATA_MARKER: &str = "no coverage data found";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummaryParseError {
    #[error("summary report has no header row naming Filename and Coverage columns")]
    MissingHeader,

    #[error("summary report has no TOTAL row")]
    MissingTotal,

    #[error("summary report TOTAL row has none of the known coverage columns")]
    NoMetricColumns,

    #[error("cannot parse {column:?} cell {cell:?} (expected `covered/total [percent%]`)")]
    UnparseableCell { column: String, cell: String },
}

/// True when the exporter's diagnostics say the profile matched no
/// instrumented code. That is a degraded result, not a failure.
pub fn is_no_coverage_data(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains(NO_DATA_MARKER)
}

/// Read totals for every kind from the structured export.
///
/// A document without `data[0].totals` is malformed; a kind missing from
/// `totals` (older exporters omit branches and instantiations) reads as zero.
pub fn parse_export_json(stdout: &str) -> Result<CoverageTotals, DomainError> {
    let doc: Value =
        serde_json::from_str(stdout).map_err(|e| DomainError::MalformedExport(e.to_string()))?;

    let totals = doc
        .get("data")
        .and_then(Value::as_array)
        .and_then(|reports| reports.first())
        .and_then(|report| report.get("totals"))
        .and_then(Value::as_object)
        .ok_or_else(|| DomainError::MalformedExport("missing data[0].totals".to_string()))?;

    let mut out = CoverageTotals::zero();
    for kind in CoverageKind::ALL {
        if let Some(metric) = totals.get(kind.export_key()) {
            *out.get_mut(kind) = metric_from_json(metric);
        }
    }
    Ok(out)
}

fn metric_from_json(v: &Value) -> MetricTotals {
    let covered = v.get("covered").and_then(Value::as_u64).unwrap_or(0);
    let total = v.get("count").and_then(Value::as_u64).unwrap_or(0);
    match v.get("percent").and_then(Value::as_f64) {
        Some(percent) => MetricTotals {
            covered,
            total,
            percent,
        },
        None => MetricTotals::from_counts(covered, total),
    }
}

/// Parse the `TOTAL` row of the textual summary report.
pub fn parse_report_summary(stdout: &str) -> Result<CoverageTotals, SummaryParseError> {
    let rows: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

    let header = rows
        .iter()
        .find(|l| l.contains("Filename") && l.contains("Coverage"))
        .ok_or(SummaryParseError::MissingHeader)?;
    let total = rows
        .iter()
        .find(|l| l.trim_start().starts_with("TOTAL"))
        .ok_or(SummaryParseError::MissingTotal)?;

    let names: Vec<&str> = COLUMN_SPLIT.split(header.trim()).collect();
    let cells: Vec<&str> = COLUMN_SPLIT.split(total.trim()).collect();

    // First column is the file name / TOTAL label.
    let columns: Vec<(&str, &str)> = names
        .iter()
        .skip(1)
        .copied()
        .zip(cells.iter().skip(1).copied())
        .collect();

    let mut out = CoverageTotals::zero();
    let mut found = 0usize;
    for kind in CoverageKind::ALL {
        let Some((column, cell)) = columns.iter().find(|(name, _)| *name == kind.report_column())
        else {
            continue;
        };
        found += 1;
        *out.get_mut(kind) = parse_cell(column, cell)?;
    }

    if found == 0 {
        return Err(SummaryParseError::NoMetricColumns);
    }
    Ok(out)
}

fn parse_cell(column: &str, cell: &str) -> Result<MetricTotals, SummaryParseError> {
    let trimmed = cell.trim();
    // The exporter prints `-` for kinds with nothing instrumented.
    if trimmed.is_empty() || trimmed == "-" {
        return Ok(MetricTotals::zero());
    }

    let unparseable = || SummaryParseError::UnparseableCell {
        column: column.to_string(),
        cell: cell.to_string(),
    };

    let caps = COUNTS.captures(trimmed).ok_or_else(unparseable)?;
    let covered: u64 = caps[1].parse().map_err(|_| unparseable())?;
    let total: u64 = caps[2].parse().map_err(|_| unparseable())?;

    match PERCENT.captures(trimmed) {
        Some(p) => {
            let percent: f64 = p[1].parse().map_err(|_| unparseable())?;
            Ok(MetricTotals {
                covered,
                total,
                percent,
            })
        }
        None => Ok(MetricTotals::from_counts(covered, total)),
    }
}
