use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use covtrace_adapters::StdProcessRunner;
use covtrace_app::{
    write_json, ResampleRequest, ResampleUseCase, SystemClock, TimelineUseCase,
};
use covtrace_config::{
    default_config_toml, discover_config, resolve_resample, resolve_timeline, ResampleOverrides,
    TimelineOverrides, DEFAULT_CONFIG_FILE,
};
use covtrace_types::{ConfigFile, GridEnd, ToolInfo};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after Ctrl-C, following the shell convention (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "covtrace",
    version,
    about = "Incremental coverage timelines for KLEE test corpora"
)]
struct Cli {
    /// Config file (default: ./covtrace.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (per-artifact progress and tool invocations)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a corpus in creation order and record cumulative coverage per event.
    Run {
        /// Instrumented target binary
        #[arg(long)]
        target: Option<PathBuf>,

        /// Directory holding the test artifacts
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Event bucket width in seconds (0 = one event per artifact)
        #[arg(long)]
        bucket: Option<f64>,

        /// Per-artifact replay timeout (e.g. "15s" or "15")
        #[arg(long)]
        timeout: Option<String>,

        /// Grace period between the terminate and kill signals
        #[arg(long)]
        kill_after: Option<String>,

        /// Raw profiles per merge invocation before switching to a two-level merge
        #[arg(long)]
        merge_chunk_size: Option<usize>,

        /// Threads passed to the merge tool (0 = CPU count)
        #[arg(long)]
        merge_threads: Option<usize>,

        /// Artifacts of one event replayed in parallel
        #[arg(long)]
        jobs: Option<usize>,

        /// Resampling step (e.g. "20m" or "1200")
        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        grid_end: Option<GridEnd>,

        /// Skip artifacts that have a `.early` marker
        #[arg(long)]
        skip_early: bool,

        /// Do not write resampled tables
        #[arg(long)]
        no_resample: bool,

        /// Resampled tables use elapsed hours as the first column
        #[arg(long)]
        hours: bool,

        /// Coverage output directory (default: <corpus>/coverage)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Directory for resampled tables (default: <out-dir>/resampled)
        #[arg(long)]
        resample_out: Option<PathBuf>,

        /// Extra artifact suffix, e.g. ".A_data" to match test*.ktest.A_data
        #[arg(long)]
        artifact_suffix: Option<String>,

        /// File whose mtime may mark an earlier run start (relative to the corpus)
        #[arg(long)]
        run_start_marker: Option<String>,

        /// Set MAKEFLAGS=-n for replays
        #[arg(long)]
        make_no_exec: bool,

        /// Replay environment variable (KEY=VALUE). Repeatable.
        #[arg(long, value_parser = parse_key_val_string)]
        env: Vec<(String, String)>,

        #[arg(long)]
        replay_tool: Option<String>,

        #[arg(long)]
        merge_tool: Option<String>,

        #[arg(long)]
        cov_tool: Option<String>,
    },

    /// Resample an existing event log onto a fixed grid.
    Resample {
        /// Event log CSV (coverage_by_group.csv)
        #[arg(long)]
        log: PathBuf,

        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        grid_end: Option<GridEnd>,

        /// Output directory (default: `resampled/` next to the log)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        #[arg(long)]
        hours: bool,
    },

    /// Write a commented starter config file.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        out: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    match real_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn real_main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_format)?;

    match cli.cmd {
        Command::Run {
            target,
            corpus,
            bucket,
            timeout,
            kill_after,
            merge_chunk_size,
            merge_threads,
            jobs,
            step,
            grid_end,
            skip_early,
            no_resample,
            hours,
            out_dir,
            resample_out,
            artifact_suffix,
            run_start_marker,
            make_no_exec,
            env,
            replay_tool,
            merge_tool,
            cov_tool,
        } => {
            let file = load_config(cli.config.as_deref())?;
            let settings = resolve_timeline(
                &file,
                TimelineOverrides {
                    target,
                    corpus,
                    bucket_sec: bucket,
                    timeout,
                    kill_after,
                    merge_chunk_size,
                    merge_threads,
                    jobs,
                    resample_step: step,
                    grid_end,
                    skip_early: flag(skip_early),
                    no_resample: flag(no_resample),
                    hours: flag(hours),
                    out_dir,
                    resample_out,
                    artifact_suffix,
                    run_start_marker,
                    make_no_exec: flag(make_no_exec),
                    env,
                    replay_tool,
                    merge_tool,
                    cov_tool,
                },
            )?;

            let runner = StdProcessRunner::detect();
            info!("replay timeouts via {}", runner.escalation().describe());

            let cancel = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(cancel.clone());

            let usecase = TimelineUseCase::new(runner, SystemClock, tool_info())
                .with_cancel_flag(cancel);
            let outcome = usecase.execute(&settings)?;

            let Some(receipt) = &outcome.receipt else {
                return Ok(ExitCode::SUCCESS);
            };
            write_json(&outcome.layout.receipt, receipt)?;
            println!("{}", outcome.layout.receipt.display());

            if outcome.interrupted() {
                warn!(
                    "interrupted after {} of {} events; partial log at {}",
                    receipt.events_merged + receipt.events_skipped,
                    receipt.events,
                    outcome.layout.event_log.display()
                );
                return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Resample {
            log,
            step,
            grid_end,
            out_dir,
            hours,
        } => {
            let file = load_config(cli.config.as_deref())?;
            let settings = resolve_resample(
                &file,
                &log,
                ResampleOverrides {
                    step,
                    grid_end,
                    out_dir,
                    hours,
                },
            )?;

            let outcome = ResampleUseCase.execute(&ResampleRequest { log, settings })?;
            for path in &outcome.files {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::InitConfig { out, force } => {
            if out.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    out.display()
                );
            }
            fs::write(&out, default_config_toml())
                .with_context(|| format!("write {}", out.display()))?;
            println!("{}", out.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, format: LogFormat) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::level_filters::LevelFilter::DEBUG
    } else if quiet {
        tracing::level_filters::LevelFilter::WARN
    } else {
        tracing::level_filters::LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

/// First Ctrl-C finishes the current event and stops; a second one exits at once.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(INTERRUPTED_EXIT_CODE));
        }
        eprintln!("interrupt received; finishing the current event (Ctrl-C again to abort)");
    });
    if let Err(err) = result {
        warn!("cannot install Ctrl-C handler: {err}");
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<ConfigFile> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let (file, path) = discover_config(explicit, &cwd)?;
    if let Some(path) = path {
        info!("using config {}", path.display());
    }
    Ok(file)
}

/// An unset boolean flag defers to the config file.
fn flag(set: bool) -> Option<bool> {
    set.then_some(true)
}

fn tool_info() -> ToolInfo {
    ToolInfo {
        name: "covtrace".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn parse_key_val_string(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| "expected KEY=VALUE".to_string())?;
    if k.is_empty() {
        return Err("expected KEY=VALUE with a non-empty KEY".to_string());
    }
    Ok((k.to_string(), v.to_string()))
}
