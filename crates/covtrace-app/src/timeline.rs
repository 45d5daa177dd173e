//! The timeline driver: replay each event in order, fold it into the
//! cumulative profile, export totals and append to the event log.

use crate::{
    epoch_to_rfc3339, Clock, CoverageExporter, EventLogWriter, ProfileMerger, ReplayConfig,
    ReplayOrchestrator, ResampleOutcome, ResampleRequest, ResampleUseCase, SidecarLogs,
};
use anyhow::Context;
use covtrace_adapters::{list_artifacts, marker_mtime, ProcessRunner};
use covtrace_config::TimelineSettings;
use covtrace_domain::build_timeline;
use covtrace_types::{
    CoverageTotals, EventRecord, RunMeta, TimelineOutputs, TimelineReceipt, ToolInfo,
    EVENT_LOG_FILE, FINAL_PROFILE_FILE, RECEIPT_FILE, TIMELINE_SCHEMA_V1,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a run puts its files, all under one coverage directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineLayout {
    pub coverage_dir: PathBuf,
    pub profraw_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub event_log: PathBuf,
    pub final_profile: PathBuf,
    pub receipt: PathBuf,
}

impl TimelineLayout {
    pub fn new(coverage_dir: impl Into<PathBuf>) -> Self {
        let coverage_dir = coverage_dir.into();
        Self {
            profraw_dir: coverage_dir.join("profraw"),
            tmp_dir: coverage_dir.join("tmp"),
            event_log: coverage_dir.join(EVENT_LOG_FILE),
            final_profile: coverage_dir.join(FINAL_PROFILE_FILE),
            receipt: coverage_dir.join(RECEIPT_FILE),
            coverage_dir,
        }
    }

    fn parts_dir(&self) -> PathBuf {
        self.tmp_dir.join("parts")
    }

    /// Create the directories and drop raw and intermediate profiles left by
    /// an earlier run, so they are never merged into this one.
    fn prepare(&self) -> anyhow::Result<()> {
        for dir in [&self.profraw_dir, &self.tmp_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        }
        clear_files(&self.profraw_dir, "profraw")?;
        clear_files(&self.tmp_dir, "profdata")?;
        Ok(())
    }
}

fn clear_files(dir: &Path, extension: &str) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            fs::remove_file(&path)
                .with_context(|| format!("remove stale {}", path.display()))?;
        }
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), "could not remove intermediate file: {err}");
    }
}

#[derive(Debug, Clone)]
pub struct TimelineOutcome {
    /// `None` when the corpus held no artifacts and nothing was done.
    pub receipt: Option<TimelineReceipt>,
    pub layout: TimelineLayout,
    pub resampled: Option<ResampleOutcome>,
}

impl TimelineOutcome {
    pub fn interrupted(&self) -> bool {
        self.receipt.as_ref().is_some_and(|r| r.interrupted)
    }
}

pub struct TimelineUseCase<R: ProcessRunner + Sync, C: Clock> {
    runner: R,
    clock: C,
    tool: ToolInfo,
    cancel: Arc<AtomicBool>,
}

impl<R: ProcessRunner + Sync, C: Clock> TimelineUseCase<R, C> {
    pub fn new(runner: R, clock: C, tool: ToolInfo) -> Self {
        Self {
            runner,
            clock,
            tool,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop before the next event once `flag` is set. The event in flight
    /// always completes, so the log never holds a half-processed event.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn execute(&self, s: &TimelineSettings) -> anyhow::Result<TimelineOutcome> {
        let started_at = self.clock.now_rfc3339();
        let layout = TimelineLayout::new(&s.coverage_dir);

        let artifacts = list_artifacts(&s.corpus, &s.artifact_pattern, s.skip_early)
            .with_context(|| format!("failed to enumerate corpus {}", s.corpus.display()))?;
        let marker = marker_mtime(&s.run_start_marker)
            .with_context(|| format!("failed to probe {}", s.run_start_marker.display()))?;

        let Some(timeline) = build_timeline(artifacts, marker, s.bucket_sec)? else {
            info!(
                corpus = %s.corpus.display(),
                pattern = %s.artifact_pattern,
                "no test artifacts found; nothing to do"
            );
            return Ok(TimelineOutcome {
                receipt: None,
                layout,
                resampled: None,
            });
        };

        let total_artifacts = timeline.artifact_count();
        let total_events = timeline.events.len();
        let t0_iso = epoch_to_rfc3339(timeline.t0);
        info!(
            "{total_artifacts} artifacts in {total_events} events, t0={t0_iso}, output {}",
            layout.coverage_dir.display()
        );

        layout.prepare()?;
        let sidecars = SidecarLogs::create(&layout.profraw_dir)?;
        let orchestrator = ReplayOrchestrator::new(
            &self.runner,
            ReplayConfig {
                replay_tool: s.tools.replay.clone(),
                target: s.target.clone(),
                profraw_dir: layout.profraw_dir.clone(),
                timeout: s.timeout,
                kill_after: s.kill_after,
                env: s.env.clone(),
                jobs: s.jobs,
            },
            sidecars,
            total_artifacts,
        );
        let merger = ProfileMerger::new(
            &self.runner,
            s.tools.merge.clone(),
            s.merge_threads,
            s.merge_chunk_size,
        );
        let exporter = CoverageExporter::new(&self.runner, s.tools.cov.clone(), &s.target);
        let mut log = EventLogWriter::create(&layout.event_log, t0_iso.clone())?;

        let parts_dir = layout.parts_dir();
        let mut cumulative: Option<PathBuf> = None;
        let mut final_totals: Option<CoverageTotals> = None;
        let mut merged = 0u64;
        let mut skipped = 0u64;
        let mut interrupted = false;

        for (i, event) in timeline.events.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                warn!(
                    "interrupted; stopping before event {}/{total_events}",
                    i + 1
                );
                interrupted = true;
                break;
            }

            let raw = orchestrator.replay_event(event)?;
            let c = orchestrator.counts();

            if raw.is_empty() {
                warn!(
                    "[event {}/{total_events}] no raw profiles from {} artifacts; skipped",
                    i + 1,
                    event.artifacts.len()
                );
                skipped += 1;
                continue;
            }

            let bucket = layout.tmp_dir.join(format!("bucket_{i:06}.profdata"));
            merger.merge(&raw, &bucket, &parts_dir)?;

            let next = layout.tmp_dir.join(format!("cumulative_{i:06}.profdata"));
            merger.fold_cumulative(cumulative.as_deref(), &bucket, &next, &parts_dir)?;

            remove_quietly(&bucket);
            for p in &raw {
                remove_quietly(p);
            }
            if let Some(prev) = cumulative.replace(next.clone()) {
                remove_quietly(&prev);
            }

            let totals = exporter.export(&next)?.totals();
            log.append(&EventRecord {
                timestamp_iso: epoch_to_rfc3339(timeline.t0 + event.elapsed_sec),
                elapsed_sec: event.elapsed_sec,
                totals,
            })?;
            final_totals = Some(totals);
            merged += 1;

            info!(
                "[event {}/{total_events}] artifacts={} replayed_total={} timeouts={} failed={}",
                i + 1,
                event.artifacts.len(),
                c.replayed,
                c.timed_out,
                c.failed
            );
        }

        let profile = match cumulative {
            Some(cum) => {
                fs::rename(&cum, &layout.final_profile).with_context(|| {
                    format!(
                        "move {} -> {}",
                        cum.display(),
                        layout.final_profile.display()
                    )
                })?;
                Some(layout.final_profile.clone())
            }
            None => None,
        };

        let resampled = match &s.resample {
            Some(settings) => Some(ResampleUseCase.execute(&ResampleRequest {
                log: layout.event_log.clone(),
                settings: settings.clone(),
            })?),
            None => None,
        };

        let receipt = TimelineReceipt {
            schema: TIMELINE_SCHEMA_V1.to_string(),
            tool: self.tool.clone(),
            run: RunMeta {
                started_at,
                ended_at: self.clock.now_rfc3339(),
            },
            corpus: s.corpus.to_string_lossy().into_owned(),
            target: s.target.to_string_lossy().into_owned(),
            t0: t0_iso,
            artifacts: total_artifacts as u64,
            events: total_events as u64,
            events_merged: merged,
            events_skipped: skipped,
            counts: orchestrator.counts(),
            final_totals,
            interrupted,
            outputs: TimelineOutputs {
                event_log: layout.event_log.to_string_lossy().into_owned(),
                profile: profile.map(|p| p.to_string_lossy().into_owned()),
                resampled: resampled
                    .iter()
                    .flat_map(|r| r.files.iter())
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            },
        };

        Ok(TimelineOutcome {
            receipt: Some(receipt),
            layout,
            resampled,
        })
    }
}
