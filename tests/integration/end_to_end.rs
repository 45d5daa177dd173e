//! End-to-end runs of the `covtrace` binary against the fake toolchain.

use super::support::{line_series, read_json, run_cmd, touch, FakeToolchain, T0};
use assert_cmd::Command;
use covtrace_types::{FAILED_LOG_FILE, TIMED_OUT_LOG_FILE, TIMELINE_SCHEMA_V1};
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

#[test]
fn three_artifacts_produce_log_profile_receipt_and_series() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("klee-out-0");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "assembly.ll", 0);
    touch(&corpus, "test000001.ktest", 10);
    touch(&corpus, "test000002.ktest", 700);
    touch(&corpus, "test000003.ktest", 1250);

    let coverage = corpus.join("coverage");
    run_cmd(tmp.path(), &tools, &corpus)
        .args(["--step", "600", "--grid-end", "last-sample"])
        .assert()
        .success()
        .stdout(predicate::str::contains("summary.json"))
        .stderr(predicate::str::contains("[event 3/3] artifacts=1 replayed_total=3"))
        .stderr(predicate::str::contains("[replay] 2/3 (66.7%) timeouts=0 failed=0"));

    assert_eq!(
        line_series(&coverage.join("coverage_by_group.csv")),
        vec![(0.0, 0), (10.0, 1), (700.0, 2), (1250.0, 3)]
    );
    assert!(coverage.join("coverage.profdata").is_file());
    assert_eq!(
        fs::read_to_string(coverage.join("coverage.profdata")).unwrap(),
        "test000001.ktest\ntest000002.ktest\ntest000003.ktest\n"
    );

    let receipt = read_json(&coverage.join("summary.json"));
    assert_eq!(receipt["schema"], TIMELINE_SCHEMA_V1);
    assert_eq!(receipt["artifacts"], 3);
    assert_eq!(receipt["events_merged"], 3);
    assert_eq!(receipt["counts"]["replayed"], 3);
    assert_eq!(receipt["final_totals"]["lines"]["covered"], 3);
    assert_eq!(receipt["interrupted"], false);

    let line = fs::read_to_string(coverage.join("resampled/line_coverage.csv")).unwrap();
    assert_eq!(
        line,
        "elapsed_sec,line_covered,line_total,line_percent\n\
         0.000000,0,10,0.00\n\
         600.000000,1,10,10.00\n\
         1200.000000,2,10,20.00\n\
         1250.000000,3,10,30.00\n"
    );
}

#[test]
fn timeouts_and_failures_are_logged_and_skipped() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001.ktest", 0);
    touch(&corpus, "test000002slow.ktest", 5);
    touch(&corpus, "test000003bad.ktest", 9);
    touch(&corpus, "test000004.ktest", 12);

    run_cmd(tmp.path(), &tools, &corpus)
        .args(["--timeout", "1", "--kill-after", "1", "--no-resample"])
        .assert()
        .success();

    let coverage = corpus.join("coverage");
    let profraw = coverage.join("profraw");
    let timed = fs::read_to_string(profraw.join(TIMED_OUT_LOG_FILE)).unwrap();
    assert_eq!(
        timed,
        format!("{}\n", corpus.join("test000002slow.ktest").display())
    );
    let failed = fs::read_to_string(profraw.join(FAILED_LOG_FILE)).unwrap();
    assert_eq!(
        failed,
        format!("{} 3\n", corpus.join("test000003bad.ktest").display())
    );

    assert_eq!(
        line_series(&coverage.join("coverage_by_group.csv")),
        vec![(0.0, 0), (0.0, 1), (12.0, 2)]
    );
    let receipt = read_json(&coverage.join("summary.json"));
    assert_eq!(receipt["counts"]["timed_out"], 1);
    assert_eq!(receipt["counts"]["failed"], 1);
    assert_eq!(receipt["events_skipped"], 2);
    assert!(!coverage.join("resampled").exists());
}

#[test]
fn text_report_fallback_gives_the_same_totals() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001.ktest", 0);
    touch(&corpus, "test000002.ktest", 30);

    run_cmd(tmp.path(), &tools, &corpus)
        .env("FAKE_COV_MODE", "report-only")
        .arg("--no-resample")
        .assert()
        .success();

    let log = corpus.join("coverage/coverage_by_group.csv");
    assert_eq!(line_series(&log), vec![(0.0, 0), (0.0, 1), (30.0, 2)]);
    let records = covtrace_app::read_event_log(&log).unwrap();
    assert_eq!(records[2].totals.functions.covered, 1);
    assert_eq!(records[2].totals.functions.total, 2);
    assert_eq!(records[2].totals.branches.total, 0);
}

#[test]
fn no_coverage_data_is_a_warning_not_a_failure() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001empty.ktest", 0);
    touch(&corpus, "test000002.ktest", 60);

    run_cmd(tmp.path(), &tools, &corpus)
        .arg("--no-resample")
        .assert()
        .success()
        .stderr(predicate::str::contains("no coverage data found"));

    let log = corpus.join("coverage/coverage_by_group.csv");
    let records = covtrace_app::read_event_log(&log).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].totals.lines.total, 0);
    assert_eq!(records[1].totals.lines.covered, 0);
    assert_eq!(records[1].totals.lines.total, 0);
    assert_eq!(records[2].totals.lines.covered, 1);
}

#[test]
fn chunked_merge_covers_every_artifact() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    for i in 1..=5 {
        touch(&corpus, &format!("test{i:06}.ktest"), i);
    }
    let merge_log = tmp.path().join("merges.log");

    run_cmd(tmp.path(), &tools, &corpus)
        .env("MERGE_CALL_LOG", &merge_log)
        .args([
            "--bucket",
            "3600",
            "--merge-chunk-size",
            "2",
            "--jobs",
            "3",
            "--no-resample",
        ])
        .assert()
        .success();

    let log = corpus.join("coverage/coverage_by_group.csv");
    assert_eq!(line_series(&log), vec![(0.0, 0), (0.0, 5)]);

    // Three partials, one merge of the partials, one cumulative fold.
    let merges = fs::read_to_string(&merge_log).unwrap();
    assert_eq!(merges.lines().count(), 5, "{merges}");
    assert!(merges.contains("part_0002.profdata"), "{merges}");
    assert!(!corpus.join("coverage/tmp/parts/part_0000.profdata").exists());
}

#[test]
fn replay_environment_is_forwarded() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001.ktest", 0);
    let env_log = tmp.path().join("env.log");

    run_cmd(tmp.path(), &tools, &corpus)
        .env("REPLAY_ENV_LOG", &env_log)
        .args(["--env", "MARK=hello", "--make-no-exec", "--no-resample"])
        .assert()
        .success();

    assert_eq!(fs::read_to_string(&env_log).unwrap(), "hello -n\n");
}

#[test]
fn standalone_resample_matches_the_run_output() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001.ktest", 0);
    touch(&corpus, "test000002.ktest", 4000);

    run_cmd(tmp.path(), &tools, &corpus)
        .args(["--step", "20m"])
        .assert()
        .success();

    let coverage = corpus.join("coverage");
    let again = tmp.path().join("again");
    #[allow(deprecated)]
    Command::cargo_bin("covtrace")
        .unwrap()
        .current_dir(tmp.path())
        .args(["resample", "--step", "1200", "--log"])
        .arg(coverage.join("coverage_by_group.csv"))
        .arg("--out-dir")
        .arg(&again)
        .assert()
        .success();

    for kind in ["function", "line", "region", "branch", "inst"] {
        let name = format!("{kind}_coverage.csv");
        assert_eq!(
            fs::read(coverage.join("resampled").join(&name)).unwrap(),
            fs::read(again.join(&name)).unwrap(),
            "{name}"
        );
    }
}

#[test]
fn rerun_replaces_previous_outputs() {
    let tmp = tempdir().unwrap();
    let tools = FakeToolchain::install(&tmp.path().join("bin"));
    let corpus = tmp.path().join("corpus");
    fs::create_dir(&corpus).unwrap();
    touch(&corpus, "test000001.ktest", 0);
    touch(&corpus, "test000002.ktest", 10);

    for _ in 0..2 {
        run_cmd(tmp.path(), &tools, &corpus)
            .arg("--no-resample")
            .assert()
            .success();
    }

    let receipt = read_json(&corpus.join("coverage/summary.json"));
    assert_eq!(receipt["final_totals"]["lines"]["covered"], 2);
    assert_eq!(
        receipt["t0"].as_str().unwrap(),
        covtrace_app::epoch_to_rfc3339(T0 as f64)
    );
    assert_eq!(
        line_series(&corpus.join("coverage/coverage_by_group.csv")).len(),
        3
    );
}
