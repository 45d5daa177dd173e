//! Integration tests for `covtrace run` and `covtrace init-config`

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn covtrace(cwd: &Path) -> Command {
    let mut cmd = Command::cargo_bin("covtrace").expect("failed to find covtrace binary");
    cmd.current_dir(cwd).env_remove("RUST_LOG");
    cmd
}

#[test]
fn run_without_target_names_the_missing_setting() {
    let tmp = tempdir().unwrap();

    covtrace(tmp.path())
        .args(["run", "--corpus", "."])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("missing required setting `target`"));
}

#[test]
fn run_on_missing_corpus_fails() {
    let tmp = tempdir().unwrap();

    covtrace(tmp.path())
        .args(["run", "--target", "/bin/true", "--corpus", "no-such-dir"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-dir"));
}

#[test]
fn empty_corpus_is_a_successful_no_op() {
    let tmp = tempdir().unwrap();
    let corpus = tmp.path().join("klee-out-0");
    fs::create_dir(&corpus).unwrap();
    fs::write(corpus.join("info"), "not an artifact").unwrap();

    covtrace(tmp.path())
        .args(["run", "--target", "/bin/true", "--corpus"])
        .arg(&corpus)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("nothing to do"));

    assert!(!corpus.join("coverage").exists());
}

#[test]
fn invalid_timeout_is_reported() {
    let tmp = tempdir().unwrap();

    covtrace(tmp.path())
        .args([
            "run",
            "--target",
            "/bin/true",
            "--corpus",
            ".",
            "--timeout",
            "soon",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration for `timeout`"));
}

#[test]
fn malformed_env_pair_is_a_usage_error() {
    let tmp = tempdir().unwrap();

    covtrace(tmp.path())
        .args(["run", "--env", "NOEQUALS"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("KEY=VALUE"));
}

#[test]
fn config_file_supplies_required_settings() {
    let tmp = tempdir().unwrap();
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    let cfg = tmp.path().join("custom.toml");
    fs::write(
        &cfg,
        format!(
            "[defaults]\ntarget = \"/bin/true\"\ncorpus = {:?}\n",
            corpus.to_string_lossy()
        ),
    )
    .unwrap();

    covtrace(tmp.path())
        .arg("--config")
        .arg(&cfg)
        .arg("run")
        .assert()
        .success()
        .stderr(predicate::str::contains("nothing to do"));
}

#[test]
fn broken_config_file_fails_with_its_path() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("covtrace.toml"), "[defaults\n").unwrap();

    covtrace(tmp.path())
        .args(["run", "--target", "/bin/true", "--corpus", "."])
        .assert()
        .failure()
        .stderr(predicate::str::contains("covtrace.toml"));
}

#[test]
fn init_config_writes_a_loadable_template() {
    let tmp = tempdir().unwrap();

    covtrace(tmp.path())
        .arg("init-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("covtrace.toml"));

    let text = fs::read_to_string(tmp.path().join("covtrace.toml")).unwrap();
    assert!(text.contains("[defaults]"));
    assert!(text.contains("merge_chunk_size = 5000"));

    // The template only comments out required keys, so `run` still asks for them.
    covtrace(tmp.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing required setting `target`"));
}

#[test]
fn init_config_refuses_to_overwrite_without_force() {
    let tmp = tempdir().unwrap();
    let out = tmp.path().join("mine.toml");
    fs::write(&out, "# keep me\n").unwrap();

    covtrace(tmp.path())
        .args(["init-config", "--out"])
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    assert_eq!(fs::read_to_string(&out).unwrap(), "# keep me\n");

    covtrace(tmp.path())
        .args(["init-config", "--force", "--out"])
        .arg(&out)
        .assert()
        .success();
    assert!(fs::read_to_string(&out).unwrap().contains("[defaults]"));
}

#[test]
fn json_log_format_emits_json_lines() {
    let tmp = tempdir().unwrap();
    let corpus = tmp.path().join("c");
    fs::create_dir(&corpus).unwrap();

    covtrace(tmp.path())
        .args(["--log-format", "json", "run", "--target", "/bin/true", "--corpus"])
        .arg(&corpus)
        .assert()
        .success()
        .stderr(predicate::str::starts_with("{"));
}
