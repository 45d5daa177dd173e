//! Application layer for covtrace.
//!
//! The app layer coordinates adapters and domain logic: it replays the
//! corpus, folds profiles, exports totals and writes the event log and the
//! resampled tables. It does not parse CLI flags.

mod coverage;
mod event_log;
mod merge;
mod replay;
mod resample;
mod timeline;

pub use coverage::{CoverageExporter, ExportOutcome, EXPORT_OUTPUT_CAP};
pub use event_log::{
    parse_event_log, read_event_log, render_event_row, EventLogError, EventLogWriter,
};
pub use merge::{ProfileMerger, MERGE_OUTPUT_CAP};
pub use replay::{ReplayConfig, ReplayOrchestrator, SidecarLogs};
pub use resample::{render_series_csv, ResampleOutcome, ResampleRequest, ResampleUseCase};
pub use timeline::{TimelineLayout, TimelineOutcome, TimelineUseCase};

use anyhow::Context;
use std::fs;
use std::path::Path;

pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        use time::format_description::well_known::Rfc3339;
        time::OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

/// Clock frozen at one instant, for reproducible receipts.
#[derive(Debug, Clone)]
pub struct FixedClock(pub String);

impl Clock for FixedClock {
    fn now_rfc3339(&self) -> String {
        self.0.clone()
    }
}

/// RFC 3339 UTC rendering of seconds since the UNIX epoch.
pub fn epoch_to_rfc3339(secs: f64) -> String {
    use time::format_description::well_known::Rfc3339;
    let nanos = (secs * 1e9).round() as i128;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{secs:.6}"))
}

/// Write via a temp file in the same directory, then rename into place.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;

    let mut tmp = parent.to_path_buf();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));

    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("create temp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write temp {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Quote a CSV field when it holds a comma, quote or line break.
pub(crate) fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
