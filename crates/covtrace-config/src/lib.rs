//! Config file loading and resolution for covtrace.
//!
//! Every option exists as a CLI flag and as a key under `[defaults]` or
//! `[tools]` in `covtrace.toml`. Precedence: CLI flag, then config file, then
//! the built-in default.

use covtrace_types::{artifact_pattern, ConfigFile, DurationSetting, GridEnd};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "covtrace.toml";

pub const DEFAULT_BUCKET_SEC: f64 = 0.0;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(2);
pub const DEFAULT_MERGE_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_RESAMPLE_STEP: Duration = Duration::from_secs(1200);
pub const DEFAULT_ARTIFACT_PATTERN: &str = "test*.ktest";
pub const DEFAULT_RUN_START_MARKER: &str = "assembly.ll";
pub const DEFAULT_REPLAY_TOOL: &str = "klee-replay";
pub const DEFAULT_MERGE_TOOL: &str = "llvm-profdata";
pub const DEFAULT_COV_TOOL: &str = "llvm-cov";

/// Coverage directory created under the corpus unless overridden.
pub const COVERAGE_DIR: &str = "coverage";
/// Resampled tables directory under the coverage directory unless overridden.
pub const RESAMPLED_DIR: &str = "resampled";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting `{0}`")]
    MissingRequired(&'static str),

    #[error("invalid duration for `{key}`: {value:?} (expected e.g. \"15s\", \"20m\" or bare seconds)")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

pub fn parse_config_str(s: &str) -> Result<ConfigFile, toml::de::Error> {
    toml::from_str(s)
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `explicit` if given, else `<cwd>/covtrace.toml` if it exists, else
/// an empty config. Returns the path actually loaded.
pub fn discover_config(
    explicit: Option<&Path>,
    cwd: &Path,
) -> Result<(ConfigFile, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        return Ok((load_config_file(path)?, Some(path.to_path_buf())));
    }
    let candidate = cwd.join(DEFAULT_CONFIG_FILE);
    if candidate.is_file() {
        let cfg = load_config_file(&candidate)?;
        return Ok((cfg, Some(candidate)));
    }
    Ok((ConfigFile::default(), None))
}

/// Bare seconds (`"15"`, `"1.5"`) or a humantime string (`"15s"`, `"20m"`).
pub fn parse_duration_str(key: &'static str, s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    let invalid = || ConfigError::InvalidDuration {
        key,
        value: s.to_string(),
    };

    if let Ok(secs) = trimmed.parse::<f64>() {
        return seconds(key, secs).map_err(|_| invalid());
    }
    humantime::parse_duration(trimmed).map_err(|_| invalid())
}

fn seconds(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidDuration {
        key,
        value: secs.to_string(),
    })
}

fn duration_setting(key: &'static str, v: &DurationSetting) -> Result<Duration, ConfigError> {
    match v {
        DurationSetting::Seconds(secs) => seconds(key, *secs),
        DurationSetting::Text(s) => parse_duration_str(key, s),
    }
}

/// CLI > file > default for a duration option.
fn pick_duration(
    key: &'static str,
    cli: Option<&str>,
    file: Option<&DurationSetting>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match (cli, file) {
        (Some(s), _) => parse_duration_str(key, s),
        (None, Some(v)) => duration_setting(key, v),
        (None, None) => Ok(default),
    }
}

/// Values given on the command line for `run`. `None` defers to the config file.
#[derive(Debug, Clone, Default)]
pub struct TimelineOverrides {
    pub target: Option<PathBuf>,
    pub corpus: Option<PathBuf>,
    pub bucket_sec: Option<f64>,
    pub timeout: Option<String>,
    pub kill_after: Option<String>,
    pub merge_chunk_size: Option<usize>,
    pub merge_threads: Option<usize>,
    pub jobs: Option<usize>,
    pub resample_step: Option<String>,
    pub grid_end: Option<GridEnd>,
    pub skip_early: Option<bool>,
    pub no_resample: Option<bool>,
    pub hours: Option<bool>,
    pub out_dir: Option<PathBuf>,
    pub resample_out: Option<PathBuf>,
    pub artifact_suffix: Option<String>,
    pub run_start_marker: Option<String>,
    pub make_no_exec: Option<bool>,
    pub env: Vec<(String, String)>,
    pub replay_tool: Option<String>,
    pub merge_tool: Option<String>,
    pub cov_tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub replay: String,
    pub merge: String,
    pub cov: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleSettings {
    pub step_sec: f64,
    pub grid_end: GridEnd,
    pub out_dir: PathBuf,

    /// Write `elapsed_hours` instead of `elapsed_sec` as the first column.
    pub hours: bool,
}

/// Fully resolved settings for one timeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSettings {
    pub target: PathBuf,
    pub corpus: PathBuf,
    pub bucket_sec: f64,
    pub timeout: Duration,
    pub kill_after: Duration,
    pub merge_chunk_size: usize,

    /// Always >= 1; a configured 0 resolves to the CPU count.
    pub merge_threads: usize,
    pub jobs: usize,

    /// File-name glob including the artifact suffix, e.g. `test*.ktest.A_data`.
    pub artifact_pattern: String,
    pub skip_early: bool,
    pub run_start_marker: PathBuf,

    /// Extra replay environment, in key order.
    pub env: Vec<(String, String)>,
    pub tools: ToolPaths,
    pub coverage_dir: PathBuf,

    /// `None` when resampling is turned off.
    pub resample: Option<ResampleSettings>,
}

pub fn resolve_timeline(
    file: &ConfigFile,
    o: TimelineOverrides,
) -> Result<TimelineSettings, ConfigError> {
    let d = &file.defaults;

    let target = o
        .target
        .or_else(|| d.target.as_ref().map(PathBuf::from))
        .ok_or(ConfigError::MissingRequired("target"))?;
    let corpus = o
        .corpus
        .or_else(|| d.corpus.as_ref().map(PathBuf::from))
        .ok_or(ConfigError::MissingRequired("corpus"))?;

    let bucket_sec = o.bucket_sec.or(d.bucket_sec).unwrap_or(DEFAULT_BUCKET_SEC);
    if !bucket_sec.is_finite() || bucket_sec < 0.0 {
        return Err(ConfigError::Invalid {
            key: "bucket_sec",
            message: format!("must be a finite number >= 0, got {bucket_sec}"),
        });
    }

    let timeout = pick_duration(
        "timeout",
        o.timeout.as_deref(),
        d.timeout.as_ref(),
        DEFAULT_TIMEOUT,
    )?;
    if timeout.is_zero() {
        return Err(ConfigError::Invalid {
            key: "timeout",
            message: "must be > 0".to_string(),
        });
    }
    let kill_after = pick_duration(
        "kill_after",
        o.kill_after.as_deref(),
        d.kill_after.as_ref(),
        DEFAULT_KILL_AFTER,
    )?;

    let merge_chunk_size = o
        .merge_chunk_size
        .or(d.merge_chunk_size)
        .unwrap_or(DEFAULT_MERGE_CHUNK_SIZE);
    if merge_chunk_size == 0 {
        return Err(ConfigError::Invalid {
            key: "merge_chunk_size",
            message: "must be >= 1".to_string(),
        });
    }

    let merge_threads = match o.merge_threads.or(d.merge_threads).unwrap_or(0) {
        0 => num_cpus::get().max(1),
        n => n,
    };

    let jobs = o.jobs.or(d.jobs).unwrap_or(1);
    if jobs == 0 {
        return Err(ConfigError::Invalid {
            key: "jobs",
            message: "must be >= 1".to_string(),
        });
    }

    let suffix = o
        .artifact_suffix
        .or_else(|| d.artifact_suffix.clone())
        .unwrap_or_default();
    let artifact_pattern = artifact_pattern(DEFAULT_ARTIFACT_PATTERN, &suffix);

    let marker = o
        .run_start_marker
        .or_else(|| d.run_start_marker.clone())
        .unwrap_or_else(|| DEFAULT_RUN_START_MARKER.to_string());
    let run_start_marker = resolve_under(&corpus, Path::new(&marker));

    let mut env: BTreeMap<String, String> = d.env.clone();
    env.extend(o.env);
    if o.make_no_exec.or(d.make_no_exec).unwrap_or(false) {
        env.insert("MAKEFLAGS".to_string(), "-n".to_string());
    }

    let tools = ToolPaths {
        replay: o
            .replay_tool
            .or_else(|| file.tools.replay.clone())
            .unwrap_or_else(|| DEFAULT_REPLAY_TOOL.to_string()),
        merge: o
            .merge_tool
            .or_else(|| file.tools.merge.clone())
            .unwrap_or_else(|| DEFAULT_MERGE_TOOL.to_string()),
        cov: o
            .cov_tool
            .or_else(|| file.tools.cov.clone())
            .unwrap_or_else(|| DEFAULT_COV_TOOL.to_string()),
    };

    let coverage_dir = o
        .out_dir
        .or_else(|| d.out_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| corpus.join(COVERAGE_DIR));

    let resample = if o.no_resample.or(d.no_resample).unwrap_or(false) {
        None
    } else {
        let step = pick_duration(
            "resample_step",
            o.resample_step.as_deref(),
            d.resample_step.as_ref(),
            DEFAULT_RESAMPLE_STEP,
        )?;
        Some(ResampleSettings {
            step_sec: positive_step(step)?,
            grid_end: o.grid_end.or(d.grid_end).unwrap_or_default(),
            out_dir: o
                .resample_out
                .or_else(|| d.resample_out.as_ref().map(PathBuf::from))
                .unwrap_or_else(|| coverage_dir.join(RESAMPLED_DIR)),
            hours: o.hours.unwrap_or(false),
        })
    };

    Ok(TimelineSettings {
        target,
        corpus,
        bucket_sec,
        timeout,
        kill_after,
        merge_chunk_size,
        merge_threads,
        jobs,
        artifact_pattern,
        skip_early: o.skip_early.or(d.skip_early).unwrap_or(false),
        run_start_marker,
        env: env.into_iter().collect(),
        tools,
        coverage_dir,
        resample,
    })
}

/// Values given on the command line for standalone `resample`.
#[derive(Debug, Clone, Default)]
pub struct ResampleOverrides {
    pub step: Option<String>,
    pub grid_end: Option<GridEnd>,
    pub out_dir: Option<PathBuf>,
    pub hours: bool,
}

/// Resolve settings for resampling the event log at `log`. Output defaults to
/// a `resampled/` directory beside the log.
pub fn resolve_resample(
    file: &ConfigFile,
    log: &Path,
    o: ResampleOverrides,
) -> Result<ResampleSettings, ConfigError> {
    let d = &file.defaults;
    let step = pick_duration(
        "resample_step",
        o.step.as_deref(),
        d.resample_step.as_ref(),
        DEFAULT_RESAMPLE_STEP,
    )?;

    let out_dir = o
        .out_dir
        .or_else(|| d.resample_out.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| {
            log.parent()
                .map(|p| p.join(RESAMPLED_DIR))
                .unwrap_or_else(|| PathBuf::from(RESAMPLED_DIR))
        });

    Ok(ResampleSettings {
        step_sec: positive_step(step)?,
        grid_end: o.grid_end.or(d.grid_end).unwrap_or_default(),
        out_dir,
        hours: o.hours,
    })
}

fn positive_step(step: Duration) -> Result<f64, ConfigError> {
    if step.is_zero() {
        return Err(ConfigError::Invalid {
            key: "resample_step",
            message: "must be > 0".to_string(),
        });
    }
    Ok(step.as_secs_f64())
}

fn resolve_under(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Commented starter config written by `covtrace init-config`.
pub fn default_config_toml() -> &'static str {
    r#"# covtrace configuration. Command-line flags override these values.

[defaults]
# target = "./build/prog.instrumented"
# corpus = "./klee-out-0"

# Event bucket width in seconds; 0 replays and records each artifact separately.
bucket_sec = 0

# Per-artifact replay timeout and the grace period before the forced kill.
timeout = "15s"
kill_after = "2s"

merge_chunk_size = 5000
# 0 uses every CPU.
merge_threads = 0
jobs = 1

resample_step = "20m"
# "ceil" or "last-sample"
grid_end = "ceil"

skip_early = false
no_resample = false
make_no_exec = false

# artifact_suffix = ".A_data"
# run_start_marker = "assembly.ll"
# out_dir = "./klee-out-0/coverage"
# resample_out = "./klee-out-0/coverage/resampled"

[defaults.env]
# ASAN_OPTIONS = "detect_leaks=0"

[tools]
# replay = "klee-replay"
# merge = "llvm-profdata"
# cov = "llvm-cov"
"#
}
