//! Fake toolchain and corpus helpers for the end-to-end tests.

use assert_cmd::Command;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const T0: u64 = 1_700_000_000;

/// Replay stand-in. Writes the artifact's name as its profile. Names
/// containing `slow` hang, `bad` exit 3 and `empty` leave an empty profile.
/// When `REPLAY_ENV_LOG` is set, appends `$MARK $MAKEFLAGS` to it.
const REPLAY_SH: &str = r#"#!/bin/sh
name=$(basename "$2")
if [ -n "$REPLAY_ENV_LOG" ]; then
  echo "$MARK $MAKEFLAGS" >> "$REPLAY_ENV_LOG"
fi
case "$name" in
  *slow*) exec sleep 30 ;;
  *bad*) exit 3 ;;
esac
out=$(printf '%s' "$LLVM_PROFILE_FILE" | sed "s/%p/$$/")
case "$name" in
  *empty*) : > "$out" ;;
  *) echo "$name" > "$out" ;;
esac
"#;

/// Merge stand-in: the output is the sorted union of the input lines.
const MERGE_SH: &str = r#"#!/bin/sh
shift
out=""
inputs=""
while [ $# -gt 0 ]; do
  case "$1" in
    -sparse|--num-threads=*) ;;
    -o) shift; out="$1" ;;
    *) inputs="$inputs $1" ;;
  esac
  shift
done
if [ -n "$MERGE_CALL_LOG" ]; then
  echo "$inputs -> $out" >> "$MERGE_CALL_LOG"
fi
cat $inputs | sort -u > "$out"
"#;

/// Export stand-in: covered lines = distinct profile lines out of 10.
/// `FAKE_COV_MODE=report-only` rejects the structured export.
const COV_SH: &str = r#"#!/bin/sh
mode="$1"
profile="${3#--instr-profile=}"
n=$(grep -c . "$profile")
if [ "$n" -eq 0 ]; then
  echo "error: $4: No coverage data found" >&2
  exit 1
fi
pct=$((n * 10))
if [ "$mode" = "export" ]; then
  if [ "$FAKE_COV_MODE" = "report-only" ]; then
    echo "error: unknown command line argument" >&2
    exit 1
  fi
  printf '{"data":[{"totals":{"functions":{"count":2,"covered":1,"percent":50},"lines":{"count":10,"covered":%s,"percent":%s}}}]}\n' "$n" "$pct"
  exit 0
fi
echo "Filename                 Function Coverage    Line Coverage"
echo "-----------------------------------------------------------"
printf 'TOTAL                    (1/2) 50.00%%         (%s/10) %s.00%%\n' "$n" "$pct"
"#;

pub struct FakeToolchain {
    pub replay: PathBuf,
    pub merge: PathBuf,
    pub cov: PathBuf,
}

impl FakeToolchain {
    pub fn install(dir: &Path) -> Self {
        fs::create_dir_all(dir).unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        Self {
            replay: write("klee-replay", REPLAY_SH),
            merge: write("llvm-profdata", MERGE_SH),
            cov: write("llvm-cov", COV_SH),
        }
    }
}

/// Create `dir/name` with mtime `T0 + offset`.
pub fn touch(dir: &Path, name: &str, offset: u64) {
    let f = File::create(dir.join(name)).unwrap();
    f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(T0 + offset))
        .unwrap();
}

/// `covtrace run` wired to the fake toolchain, with cwd at `root`.
pub fn run_cmd(root: &Path, tools: &FakeToolchain, corpus: &Path) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("covtrace").expect("failed to find covtrace binary");
    cmd.current_dir(root)
        .env_remove("RUST_LOG")
        .arg("run")
        .arg("--target")
        .arg("/build/prog.instrumented")
        .arg("--corpus")
        .arg(corpus)
        .arg("--replay-tool")
        .arg(&tools.replay)
        .arg("--merge-tool")
        .arg(&tools.merge)
        .arg("--cov-tool")
        .arg(&tools.cov);
    cmd
}

pub fn read_json(path: &Path) -> serde_json::Value {
    let text = fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

/// `(elapsed_sec, line_covered)` per event-log row.
pub fn line_series(log: &Path) -> Vec<(f64, u64)> {
    covtrace_app::read_event_log(log)
        .unwrap()
        .iter()
        .map(|r| (r.elapsed_sec, r.totals.lines.covered))
        .collect()
}
