//! CLI contract tests.
//!
//! Contract guarantees tested:
//! - Exit code 0 when every test passed, 1 when anything failed
//! - Actionable error messages for configuration and subject problems
//! - `--json` prints one parseable document on stdout
//! - Per-test subject output lands in the output directory

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// A fake philosopher: survives liveness runs, dies on time when asked
/// to with 3 philosophers.
const GOOD_PHILO: &str = r#"if [ "$1" = "3" ]; then
  printf '0 1 has taken a fork\n0 1 is eating\n310 3 died\n'
  exit 0
fi
while :; do sleep 0.1; done"#;

/// Dies almost immediately in every scenario.
const DYING_PHILO: &str = "printf '0 1 is thinking\\n5 1 died\\n'\nexit 0";

fn write_subject(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create subject dir");
    }
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write subject");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[allow(deprecated)]
fn socrates() -> Command {
    let mut cmd = Command::cargo_bin("socrates").expect("socrates binary should be built");
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("SOCRATES_CONFIG");
    cmd.env("NO_COLOR", "1");
    cmd
}

/// Quick settings: one short repetition per scenario, two trials.
fn quick_test(output_dir: &Path) -> Command {
    let mut cmd = socrates();
    cmd.args([
        "test",
        "--calibration-samples",
        "0",
        "-n",
        "1",
        "-t",
        "1",
        "--poll-interval-ms",
        "100",
        "--trials",
        "2",
    ]);
    cmd.arg("--output-dir").arg(output_dir);
    cmd
}

// =============================================================================
// Help and version
// =============================================================================

#[test]
fn help_lists_subcommands() {
    socrates()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("test"))
        .stdout(predicate::str::contains("calibrate"))
        .stdout(predicate::str::contains("load"));
}

#[test]
fn version_prints_package_version() {
    socrates()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_variant_is_a_usage_error() {
    socrates()
        .args(["test", "--philo", "7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown variant"));
}

// =============================================================================
// Suite exit codes
// =============================================================================

#[test]
fn passing_subject_exits_zero() {
    let dir = TempDir::new().unwrap();
    let subject = dir.path().join("cli_good_philo");
    write_subject(&subject, GOOD_PHILO);
    let out = dir.path().join("out");

    quick_test(&out)
        .arg("--subject")
        .arg(&subject)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("All tests passed"));

    assert!(out.join("cli_good_philo_even_1_out.txt").exists());
    assert!(out.join("cli_good_philo_odd_1_out.txt").exists());
    assert!(out.join("cli_good_philo_death_timing_2_out.txt").exists());
}

#[test]
fn dying_subject_exits_one_with_reasons() {
    let dir = TempDir::new().unwrap();
    let subject = dir.path().join("cli_dying_philo");
    write_subject(&subject, DYING_PHILO);

    quick_test(&dir.path().join("out"))
        .arg("--subject")
        .arg(&subject)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("premature exit"))
        // The odd scenario and the death-timing suite still run after the
        // even scenario failed.
        .stdout(predicate::str::contains("odd FAIL"))
        .stdout(predicate::str::contains("death timing #1"))
        .stdout(predicate::str::contains("Some tests failed"));
}

#[test]
fn json_report_is_parseable() {
    let dir = TempDir::new().unwrap();
    let subject = dir.path().join("cli_json_philo");
    write_subject(&subject, DYING_PHILO);

    let output = quick_test(&dir.path().join("out"))
        .arg("--no-output-files")
        .arg("--json")
        .arg("--subject")
        .arg(&subject)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    let subjects = report["subjects"].as_array().unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["subject"]["name"], "cli_json_philo");
    let liveness = subjects[0]["liveness"].as_array().unwrap();
    assert_eq!(liveness.len(), 2, "every scenario runs after a failure");
    assert_eq!(liveness[0]["scenario"], "even");
    assert_eq!(liveness[0]["verdict"]["failure"]["kind"], "premature_exit");
    assert_eq!(liveness[1]["scenario"], "odd");
    assert_eq!(liveness[1]["verdict"]["failure"]["kind"], "premature_exit");

    let death_timing = &subjects[0]["death_timing"]["verdict"];
    assert_eq!(death_timing["passed"], false);
    assert_eq!(death_timing["failure"]["kind"], "timing_deviation_exceeded");
    assert!(!dir.path().join("out").exists());
}

#[test]
fn project_mode_finds_variant_binaries() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("philosophers");
    write_subject(&project.join("philo").join("philo"), GOOD_PHILO);

    quick_test(&dir.path().join("out"))
        .arg(&project)
        .args(["--philo", "1", "--no-build"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("philo"));
}

#[test]
fn project_without_binaries_explains_how_to_build() {
    let dir = TempDir::new().unwrap();
    let project: PathBuf = dir.path().join("empty_project");
    std::fs::create_dir_all(&project).unwrap();

    quick_test(&dir.path().join("out"))
        .arg(&project)
        .arg("--no-build")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No subject binary found"))
        .stderr(predicate::str::contains("To fix:"));
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn invalid_config_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("socrates.toml");
    std::fs::write(&config, "[liveness]\npoll_interval_ms = 5000\n").unwrap();

    socrates()
        .arg("--config")
        .arg(&config)
        .arg("load")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("liveness.poll_interval_ms"));
}

#[test]
fn load_prints_a_reading() {
    socrates()
        .arg("load")
        .assert()
        .success()
        .stdout(predicate::str::contains("Host load"));
}

#[test]
fn calibrate_reports_mean_and_peak() {
    socrates()
        .args(["calibrate", "--samples", "2", "--sleep-ms", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mean"))
        .stdout(predicate::str::contains("peak"));
}
