//! Std adapters for covtrace.
//!
//! In clean-arch terms: this is where we touch the world.
//! Subprocesses run through [`ProcessRunner`]; the corpus on disk is read by
//! the [`corpus`] helpers.

pub mod corpus;

pub use corpus::{early_marker_path, file_mtime, list_artifacts, list_raw_profiles, marker_mtime};

use anyhow::Context;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Exit code reported for a command stopped by the timeout path.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code of the native facility when its forced kill fired (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,

    /// Wall-clock limit. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Time between the graceful stop request and the forced kill.
    pub kill_grace: Duration,

    /// Bytes of stdout/stderr kept. `0` discards output entirely.
    pub output_cap_bytes: usize,
}

impl CommandSpec {
    /// A command with no timeout, no extra environment and `cap` bytes of output kept.
    pub fn new(argv: Vec<String>, output_cap_bytes: usize) -> Self {
        Self {
            argv,
            cwd: None,
            env: Vec::new(),
            timeout: None,
            kill_grace: Duration::ZERO,
            output_cap_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub wall_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("command argv must not be empty")]
    EmptyArgv,

    #[error("corpus directory {0} does not exist or is not a directory")]
    CorpusNotFound(PathBuf),

    #[error("path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError>;
}

/// How a timed-out command is stopped.
///
/// Both strategies honour the same contract: request a graceful stop when the
/// timeout expires, wait up to the grace period, then force-kill.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Escalation {
    /// Wrap the command in the system `timeout` utility.
    Native { timeout_bin: PathBuf },

    /// Poll the child ourselves and signal its process group.
    #[default]
    Portable,
}

impl Escalation {
    /// Prefer the system `timeout` utility when it is on `PATH`.
    pub fn detect() -> Self {
        #[cfg(unix)]
        {
            if let Ok(timeout_bin) = which::which("timeout") {
                return Escalation::Native { timeout_bin };
            }
            let fallback = PathBuf::from("/usr/bin/timeout");
            if fallback.is_file() {
                return Escalation::Native {
                    timeout_bin: fallback,
                };
            }
        }
        Escalation::Portable
    }

    pub fn describe(&self) -> String {
        match self {
            Escalation::Native { timeout_bin } => format!("native ({})", timeout_bin.display()),
            Escalation::Portable => "portable".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct StdProcessRunner {
    escalation: Escalation,
}

impl StdProcessRunner {
    pub fn new(escalation: Escalation) -> Self {
        Self { escalation }
    }

    /// Runner using whichever escalation strategy this host supports.
    pub fn detect() -> Self {
        Self::new(Escalation::detect())
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }
}

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        if spec.argv.is_empty() {
            return Err(AdapterError::EmptyArgv);
        }

        match (&self.escalation, spec.timeout) {
            (Escalation::Native { timeout_bin }, Some(limit)) => {
                run_native_timeout(timeout_bin, limit, spec)
            }
            _ => run_direct(spec),
        }
    }
}

/// `timeout --kill-after=<grace>s <limit>s <argv..>`; 124 and 137 mean timed out.
fn run_native_timeout(
    timeout_bin: &std::path::Path,
    limit: Duration,
    spec: &CommandSpec,
) -> Result<RunResult, AdapterError> {
    let argv = native_timeout_argv(timeout_bin, limit, spec);
    let wrapped = CommandSpec {
        argv,
        timeout: None,
        ..spec.clone()
    };
    let mut res = run_direct(&wrapped)?;
    res.timed_out = matches!(res.exit_code, TIMEOUT_EXIT_CODE | KILLED_EXIT_CODE);
    Ok(res)
}

/// `timeout` reads a zero `--kill-after` as "never kill", so a zero grace
/// period sends SIGKILL straight away instead.
fn native_timeout_argv(
    timeout_bin: &std::path::Path,
    limit: Duration,
    spec: &CommandSpec,
) -> Vec<String> {
    let mut argv = Vec::with_capacity(spec.argv.len() + 4);
    argv.push(timeout_bin.to_string_lossy().into_owned());
    if spec.kill_grace.is_zero() {
        argv.push("-s".to_string());
        argv.push("KILL".to_string());
    } else {
        argv.push(format!("--kill-after={}", format_secs(spec.kill_grace)));
    }
    argv.push(format_secs(limit));
    argv.extend(spec.argv.iter().cloned());
    argv
}

fn format_secs(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}s", d.as_secs_f64())
    }
}

fn truncate(mut bytes: Vec<u8>, cap: usize) -> Vec<u8> {
    if bytes.len() > cap {
        bytes.truncate(cap);
    }
    bytes
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.argv[0]);
    if spec.argv.len() > 1 {
        cmd.args(&spec.argv[1..]);
    }

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    if spec.output_cap_bytes == 0 {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
    } else {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    }
    cmd
}

fn read_with_cap<R: std::io::Read>(reader: &mut R, cap: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 8192];

    loop {
        match reader.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let remaining = cap - buf.len();
                    let take = remaining.min(n);
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
            Err(_) => break,
        }
    }

    buf
}

type Capture = Option<std::thread::JoinHandle<Vec<u8>>>;

fn spawn_capture<R: std::io::Read + Send + 'static>(pipe: Option<R>, cap: usize) -> Capture {
    pipe.map(|mut r| std::thread::spawn(move || read_with_cap(&mut r, cap)))
}

fn join_capture(handle: Capture, cap: usize) -> Vec<u8> {
    let bytes = handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    truncate(bytes, cap)
}

#[cfg(unix)]
fn run_direct(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    use std::os::unix::process::{CommandExt, ExitStatusExt};

    let start = Instant::now();

    let mut cmd = build_command(spec);
    if spec.timeout.is_some() {
        // Own process group so the stop signals reach grandchildren too.
        cmd.process_group(0);
    }

    debug!(argv = ?spec.argv, timeout = ?spec.timeout, "spawning");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv))
        .map_err(AdapterError::Other)?;

    let pid = child.id() as libc::pid_t;
    let cap = spec.output_cap_bytes;
    let out_handle = spawn_capture(child.stdout.take(), cap);
    let err_handle = spawn_capture(child.stderr.take(), cap);

    let (status_raw, timed_out) = wait_with_escalation(pid, spec.timeout, spec.kill_grace)?;

    // Safety: the child was reaped via waitpid; drop the handle without waiting.
    drop(child);

    let stdout = join_capture(out_handle, cap);
    let stderr = join_capture(err_handle, cap);

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        std::process::ExitStatus::from_raw(status_raw)
            .code()
            .unwrap_or(-1)
    };

    Ok(RunResult {
        wall_ms: start.elapsed().as_millis() as u64,
        exit_code,
        timed_out,
        stdout,
        stderr,
    })
}

/// Wait for `pid`; past the timeout send SIGTERM to its group, wait out the
/// grace period, then SIGKILL and reap.
#[cfg(unix)]
fn wait_with_escalation(
    pid: libc::pid_t,
    timeout: Option<Duration>,
    grace: Duration,
) -> Result<(libc::c_int, bool), AdapterError> {
    let Some(limit) = timeout else {
        return Ok((wait_blocking(pid)?, false));
    };

    if let Some(status) = poll_until(pid, Instant::now() + limit)? {
        return Ok((status, false));
    }

    debug!(pid, "timeout expired, sending SIGTERM to process group");
    signal_group(pid, libc::SIGTERM);
    if let Some(status) = poll_until(pid, Instant::now() + grace)? {
        return Ok((status, true));
    }

    debug!(pid, "grace period expired, sending SIGKILL to process group");
    signal_group(pid, libc::SIGKILL);
    Ok((wait_blocking(pid)?, true))
}

#[cfg(unix)]
fn signal_group(pid: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(-pid, signal);
    }
}

#[cfg(unix)]
fn poll_until(pid: libc::pid_t, deadline: Instant) -> Result<Option<libc::c_int>, AdapterError> {
    loop {
        if let Some(status) = waitpid(pid, libc::WNOHANG)? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn wait_blocking(pid: libc::pid_t) -> Result<libc::c_int, AdapterError> {
    loop {
        if let Some(status) = waitpid(pid, 0)? {
            return Ok(status);
        }
    }
}

/// `Ok(None)` means still running (only with `WNOHANG`).
#[cfg(unix)]
fn waitpid(pid: libc::pid_t, options: libc::c_int) -> Result<Option<libc::c_int>, AdapterError> {
    let mut status: libc::c_int = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, options) };

        if res == pid {
            return Ok(Some(status));
        }
        if res == 0 {
            return Ok(None);
        }
        if res == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(AdapterError::Other(anyhow::anyhow!("waitpid failed: {err}")));
        }

        return Err(AdapterError::Other(anyhow::anyhow!(
            "waitpid returned unexpected pid: {res}"
        )));
    }
}

#[cfg(not(unix))]
fn run_direct(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    let start = Instant::now();

    debug!(argv = ?spec.argv, timeout = ?spec.timeout, "spawning");
    let mut child = build_command(spec)
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv))
        .map_err(AdapterError::Other)?;

    let cap = spec.output_cap_bytes;
    let out_handle = spawn_capture(child.stdout.take(), cap);
    let err_handle = spawn_capture(child.stderr.take(), cap);

    let mut timed_out = false;
    let status = match spec.timeout {
        None => child.wait().context("failed to wait for child")?,
        Some(limit) => loop {
            if let Some(status) = child.try_wait().context("failed to poll child")? {
                break status;
            }
            if start.elapsed() >= limit {
                // No process groups here: the grace period collapses to an immediate kill.
                timed_out = true;
                let _ = child.kill();
                break child.wait().context("failed to reap killed child")?;
            }
            std::thread::sleep(POLL_INTERVAL);
        },
    };

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.code().unwrap_or(-1)
    };

    Ok(RunResult {
        wall_ms: start.elapsed().as_millis() as u64,
        exit_code,
        timed_out,
        stdout: join_capture(out_handle, cap),
        stderr: join_capture(err_handle, cap),
    })
}
