use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("debussy").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("watch"))
        .stdout(predicate::str::contains("board"))
        .stdout(predicate::str::contains("metrics"));
}

#[test]
fn config_set_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let mut set = Command::cargo_bin("debussy").unwrap();
    set.current_dir(dir.path())
        .args(["config", "base_branch", "feature/auth"]);
    set.assert().success();

    let mut get = Command::cargo_bin("debussy").unwrap();
    get.current_dir(dir.path()).args(["config", "base_branch"]);
    get.assert()
        .success()
        .stdout(predicate::str::contains("base_branch = feature/auth"));
}

#[test]
fn config_rejects_unknown_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("debussy").unwrap();
    cmd.current_dir(dir.path()).args(["config", "max_developers", "3"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown config key"));
}

#[test]
fn pause_and_resume_toggle_the_flag() {
    let dir = tempfile::tempdir().unwrap();

    let mut pause = Command::cargo_bin("debussy").unwrap();
    pause.current_dir(dir.path()).arg("pause");
    pause.assert().success();

    let mut get = Command::cargo_bin("debussy").unwrap();
    get.current_dir(dir.path()).args(["config", "paused"]);
    get.assert()
        .success()
        .stdout(predicate::str::contains("paused = true"));

    let mut resume = Command::cargo_bin("debussy").unwrap();
    resume.current_dir(dir.path()).arg("resume");
    resume.assert().success();

    let mut get_again = Command::cargo_bin("debussy").unwrap();
    get_again.current_dir(dir.path()).args(["config", "paused"]);
    get_again
        .assert()
        .success()
        .stdout(predicate::str::contains("paused = false"));
}

#[test]
fn metrics_without_events_reports_nothing_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("debussy").unwrap();
    cmd.current_dir(dir.path()).arg("metrics");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No pipeline events recorded yet."));
}

#[test]
fn backup_without_tracker_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("debussy").unwrap();
    cmd.current_dir(dir.path()).arg("backup");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("nothing to back up"));
}
