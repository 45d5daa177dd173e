//! Test doubles for covtrace.
//!
//! [`FakeProcessRunner`] answers every command through a handler closure and
//! records what it was asked to run, so use cases can be exercised without
//! spawning real tools.

use covtrace_adapters::{AdapterError, CommandSpec, ProcessRunner, RunResult, TIMEOUT_EXIT_CODE};
use std::sync::{Arc, Mutex};

type Handler = dyn Fn(&CommandSpec) -> Result<RunResult, AdapterError> + Send + Sync;

/// Process runner driven by a closure. Cloning shares the call log.
#[derive(Clone)]
pub struct FakeProcessRunner {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl std::fmt::Debug for FakeProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcessRunner")
            .field("calls", &self.calls().len())
            .finish()
    }
}

impl FakeProcessRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<RunResult, AdapterError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every command succeeds with empty output.
    pub fn always_ok() -> Self {
        Self::new(|_| Ok(ok("")))
    }

    /// Snapshot of every command run so far, in call order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// argv of every call whose program (argv[0]) ends with `program`.
    pub fn argv_of(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.argv.first().is_some_and(|p| p.ends_with(program)))
            .map(|c| c.argv)
            .collect()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        if spec.argv.is_empty() {
            return Err(AdapterError::EmptyArgv);
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        (self.handler)(spec)
    }
}

/// Exit 0 with `stdout`.
pub fn ok(stdout: &str) -> RunResult {
    RunResult {
        wall_ms: 1,
        exit_code: 0,
        timed_out: false,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Non-zero exit with `stderr`.
pub fn exit(code: i32, stderr: &str) -> RunResult {
    RunResult {
        wall_ms: 1,
        exit_code: code,
        timed_out: false,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Stopped by the timeout path.
pub fn timed_out() -> RunResult {
    RunResult {
        wall_ms: 1,
        exit_code: TIMEOUT_EXIT_CODE,
        timed_out: true,
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

/// Value of `key` in the command environment, if set.
pub fn env_var<'a>(spec: &'a CommandSpec, key: &str) -> Option<&'a str> {
    spec.env
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Value of the last `-o <path>` pair in argv.
pub fn output_arg(spec: &CommandSpec) -> Option<&str> {
    spec.argv
        .windows(2)
        .rev()
        .find(|w| w[0] == "-o")
        .map(|w| w[1].as_str())
}
