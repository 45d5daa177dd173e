//! Resample an event log into one fixed-interval table per coverage kind.

use crate::{atomic_write, read_event_log};
use anyhow::Context;
use covtrace_config::ResampleSettings;
use covtrace_domain::{resample, ResampledSample};
use covtrace_types::{CoverageKind, ELAPSED_COLUMN, ELAPSED_HOURS_COLUMN};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ResampleRequest {
    pub log: PathBuf,
    pub settings: ResampleSettings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResampleOutcome {
    /// Written tables, in [`CoverageKind::ALL`] order. Empty for an empty log.
    pub files: Vec<PathBuf>,
    pub points: usize,
    pub records: usize,
}

/// Render one kind's series. The first column is `elapsed_hours`
/// (`elapsed_sec / 3600`) when `hours` is set.
pub fn render_series_csv(kind: CoverageKind, samples: &[ResampledSample], hours: bool) -> String {
    let mut out = String::new();
    let first = if hours {
        ELAPSED_HOURS_COLUMN
    } else {
        ELAPSED_COLUMN
    };
    let _ = writeln!(
        out,
        "{first},{},{},{}",
        kind.covered_column(),
        kind.total_column(),
        kind.percent_column()
    );
    for s in samples {
        let t = if hours {
            s.elapsed_sec / 3600.0
        } else {
            s.elapsed_sec
        };
        let m = s.totals.get(kind);
        let _ = writeln!(out, "{t:.6},{},{},{:.2}", m.covered, m.total, m.percent);
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResampleUseCase;

impl ResampleUseCase {
    pub fn execute(&self, req: &ResampleRequest) -> anyhow::Result<ResampleOutcome> {
        let records = read_event_log(&req.log)
            .with_context(|| format!("read event log {}", req.log.display()))?;
        if records.is_empty() {
            info!(log = %req.log.display(), "event log has no records; nothing to resample");
            return Ok(ResampleOutcome::default());
        }

        let s = &req.settings;
        let samples = resample(&records, s.step_sec, s.grid_end)?;

        let mut files = Vec::with_capacity(CoverageKind::ALL.len());
        for kind in CoverageKind::ALL {
            let path = s.out_dir.join(kind.series_file_name());
            atomic_write(&path, render_series_csv(kind, &samples, s.hours).as_bytes())
                .with_context(|| format!("write {}", path.display()))?;
            files.push(path);
        }

        info!(
            records = records.len(),
            points = samples.len(),
            out = %s.out_dir.display(),
            "resampled event log"
        );
        Ok(ResampleOutcome {
            files,
            points: samples.len(),
            records: records.len(),
        })
    }
}
