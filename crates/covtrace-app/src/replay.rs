//! Replay orchestration: run the target against every artifact of an event.

use anyhow::Context;
use covtrace_adapters::{list_raw_profiles, CommandSpec, ProcessRunner};
use covtrace_types::{
    Event, ReplayCounts, ReplayStatus, TestArtifact, FAILED_LOG_FILE, TIMED_OUT_LOG_FILE,
};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable the instrumented target reads its profile path from.
const PROFILE_ENV: &str = "LLVM_PROFILE_FILE";

/// Info-level replay progress lines per run.
const PROGRESS_LINES: u64 = 100;

/// Whether the `replayed`-th replay of `total` gets an info progress line.
fn progress_due(replayed: u64, total: u64) -> bool {
    let stride = (total / PROGRESS_LINES).max(1);
    replayed % stride == 0 || replayed >= total
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub replay_tool: String,
    pub target: PathBuf,
    pub profraw_dir: PathBuf,
    pub timeout: Duration,
    pub kill_after: Duration,
    pub env: Vec<(String, String)>,

    /// Parallel replays within one event.
    pub jobs: usize,
}

/// Newline-delimited logs of timed-out (`path`) and failed (`path exit_code`)
/// replays, flushed per entry.
#[derive(Debug)]
pub struct SidecarLogs {
    timed_out: File,
    failed: File,
}

impl SidecarLogs {
    /// Create (truncating) both logs in `dir`.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        let open = |name: &str| {
            let path = dir.join(name);
            File::create(&path).with_context(|| format!("create {}", path.display()))
        };
        Ok(Self {
            timed_out: open(TIMED_OUT_LOG_FILE)?,
            failed: open(FAILED_LOG_FILE)?,
        })
    }

    pub fn record(&mut self, artifact: &Path, status: ReplayStatus) -> anyhow::Result<()> {
        match status {
            ReplayStatus::Succeeded => Ok(()),
            ReplayStatus::TimedOut => {
                writeln!(self.timed_out, "{}", artifact.display())?;
                self.timed_out.flush()?;
                Ok(())
            }
            ReplayStatus::Failed { exit_code } => {
                writeln!(self.failed, "{} {exit_code}", artifact.display())?;
                self.failed.flush()?;
                Ok(())
            }
        }
    }
}

/// Counters and sidecar logs share one lock so parallel workers never
/// interleave a count with its log line.
#[derive(Debug)]
struct ReplayState {
    counts: ReplayCounts,
    sidecars: SidecarLogs,
}

pub struct ReplayOrchestrator<'r, R: ProcessRunner + Sync> {
    runner: &'r R,
    cfg: ReplayConfig,
    total_artifacts: usize,
    state: Mutex<ReplayState>,
}

impl<'r, R: ProcessRunner + Sync> ReplayOrchestrator<'r, R> {
    pub fn new(
        runner: &'r R,
        cfg: ReplayConfig,
        sidecars: SidecarLogs,
        total_artifacts: usize,
    ) -> Self {
        Self {
            runner,
            cfg,
            total_artifacts,
            state: Mutex::new(ReplayState {
                counts: ReplayCounts::default(),
                sidecars,
            }),
        }
    }

    pub fn counts(&self) -> ReplayCounts {
        self.state
            .lock()
            .map(|s| s.counts)
            .unwrap_or_else(|poisoned| poisoned.into_inner().counts)
    }

    fn spec_for(&self, artifact: &TestArtifact) -> CommandSpec {
        let pattern = self
            .cfg
            .profraw_dir
            .join(format!("{}-%p.profraw", artifact.name()));

        let mut env = self.cfg.env.clone();
        env.push((PROFILE_ENV.to_string(), pattern.to_string_lossy().into_owned()));

        CommandSpec {
            argv: vec![
                self.cfg.replay_tool.clone(),
                self.cfg.target.to_string_lossy().into_owned(),
                artifact.path.to_string_lossy().into_owned(),
            ],
            cwd: None,
            env,
            timeout: Some(self.cfg.timeout),
            kill_grace: self.cfg.kill_after,
            output_cap_bytes: 0,
        }
    }

    /// Replay one artifact and return its outcome plus the raw profiles it left.
    ///
    /// Timeouts and failures are outcomes, not errors. A replay tool that
    /// cannot even be spawned counts as a failure with exit code -1.
    pub fn replay_artifact(
        &self,
        artifact: &TestArtifact,
    ) -> anyhow::Result<(ReplayStatus, Vec<PathBuf>)> {
        let spec = self.spec_for(artifact);
        let status = match self.runner.run(&spec) {
            Ok(res) if res.timed_out => ReplayStatus::TimedOut,
            Ok(res) if res.exit_code != 0 => ReplayStatus::Failed {
                exit_code: res.exit_code,
            },
            Ok(_) => ReplayStatus::Succeeded,
            Err(err) => {
                warn!(artifact = %artifact.path.display(), "replay could not start: {err:#}");
                ReplayStatus::Failed { exit_code: -1 }
            }
        };

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("replay state lock poisoned"))?;
            state.counts.record(status);
            state
                .sidecars
                .record(&artifact.path, status)
                .context("failed to append to sidecar log")?;

            let c = state.counts;
            let pct = if self.total_artifacts == 0 {
                0.0
            } else {
                100.0 * c.replayed as f64 / self.total_artifacts as f64
            };
            debug!(artifact = %artifact.name(), ?status, "replayed");
            if progress_due(c.replayed, self.total_artifacts as u64) {
                info!(
                    "[replay] {}/{} ({pct:.1}%) timeouts={} failed={}",
                    c.replayed, self.total_artifacts, c.timed_out, c.failed
                );
            }
        }

        let profiles = list_raw_profiles(&self.cfg.profraw_dir, &artifact.name())
            .with_context(|| format!("list raw profiles for {}", artifact.name()))?;
        Ok((status, profiles))
    }

    /// Replay every artifact in `event` (up to `jobs` at a time) and return
    /// the raw profiles in artifact order.
    pub fn replay_event(&self, event: &Event) -> anyhow::Result<Vec<PathBuf>> {
        let workers = self.cfg.jobs.clamp(1, event.artifacts.len().max(1));

        if workers == 1 {
            let mut out = Vec::new();
            for artifact in &event.artifacts {
                out.extend(self.replay_artifact(artifact)?.1);
            }
            return Ok(out);
        }

        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Vec<PathBuf>>>> =
            Mutex::new(vec![None; event.artifacts.len()]);

        std::thread::scope(|scope| -> anyhow::Result<()> {
            let next = &next;
            let slots = &slots;
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || -> anyhow::Result<()> {
                        loop {
                            let i = next.fetch_add(1, Ordering::SeqCst);
                            let Some(artifact) = event.artifacts.get(i) else {
                                return Ok(());
                            };
                            let (_, profiles) = self.replay_artifact(artifact)?;
                            let mut slots = slots
                                .lock()
                                .map_err(|_| anyhow::anyhow!("replay slot lock poisoned"))?;
                            slots[i] = Some(profiles);
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join()
                    .map_err(|_| anyhow::anyhow!("replay worker panicked"))??;
            }
            Ok(())
        })?;

        let slots = slots
            .into_inner()
            .map_err(|_| anyhow::anyhow!("replay slot lock poisoned"))?;
        Ok(slots.into_iter().flatten().flatten().collect())
    }
}
