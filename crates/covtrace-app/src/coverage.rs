//! Coverage export: structured JSON first, text report as fallback.

use anyhow::Context;
use covtrace_adapters::{CommandSpec, ProcessRunner, RunResult};
use covtrace_domain::{is_no_coverage_data, parse_export_json, parse_report_summary};
use covtrace_types::CoverageTotals;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bytes of exporter stdout kept. A truncated JSON export fails to parse and
/// falls back to the text report.
pub const EXPORT_OUTPUT_CAP: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExportOutcome {
    Totals(CoverageTotals),

    /// The exporter found no coverage data for the profile.
    NoData,
}

impl ExportOutcome {
    /// `NoData` reads as all-zero totals (denominators included).
    pub fn totals(&self) -> CoverageTotals {
        match self {
            ExportOutcome::Totals(t) => *t,
            ExportOutcome::NoData => CoverageTotals::zero(),
        }
    }
}

pub struct CoverageExporter<'r, R: ProcessRunner> {
    runner: &'r R,
    tool: String,
    target: PathBuf,
}

impl<'r, R: ProcessRunner> CoverageExporter<'r, R> {
    pub fn new(runner: &'r R, tool: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            target: target.into(),
        }
    }

    pub fn export(&self, profile: &Path) -> anyhow::Result<ExportOutcome> {
        let json = self.invoke("export", profile)?;
        if json.success() {
            match parse_export_json(&json.stdout_lossy()) {
                Ok(totals) => return Ok(ExportOutcome::Totals(totals)),
                Err(err) => warn!("unreadable structured export ({err}); trying text report"),
            }
        } else if is_no_coverage_data(&json.stderr_lossy()) {
            self.warn_no_data("export", profile);
            return Ok(ExportOutcome::NoData);
        } else {
            debug!(exit = json.exit_code, "structured export failed; trying text report");
        }

        let report = self.invoke("report", profile)?;
        if report.success() {
            let totals = parse_report_summary(&report.stdout_lossy()).with_context(|| {
                format!(
                    "cannot read {} report for {}:\n{}",
                    self.tool,
                    profile.display(),
                    report.stdout_lossy()
                )
            })?;
            return Ok(ExportOutcome::Totals(totals));
        }
        if is_no_coverage_data(&report.stderr_lossy()) {
            self.warn_no_data("report", profile);
            return Ok(ExportOutcome::NoData);
        }

        anyhow::bail!(
            "{} failed for {} with profile {} (exit {}):\n{}",
            self.tool,
            self.target.display(),
            profile.display(),
            report.exit_code,
            report.stderr_lossy()
        )
    }

    fn warn_no_data(&self, mode: &str, profile: &Path) {
        warn!(
            "{} {mode}: no coverage data found for {} with profile {}; recording zero totals",
            self.tool,
            self.target.display(),
            profile.display()
        );
    }

    fn invoke(&self, mode: &str, profile: &Path) -> anyhow::Result<RunResult> {
        let argv = vec![
            self.tool.clone(),
            mode.to_string(),
            "--summary-only".to_string(),
            format!("--instr-profile={}", profile.display()),
            self.target.to_string_lossy().into_owned(),
        ];
        self.runner
            .run(&CommandSpec::new(argv, EXPORT_OUTPUT_CAP))
            .with_context(|| format!("failed to run {} {mode}", self.tool))
    }
}
