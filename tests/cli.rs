use assert_cmd::Command;
use predicates::prelude::*;

fn fleetvisord() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("fleetvisord").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    fleetvisord().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    fleetvisord()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fv"));
}

#[test]
fn test_no_args_shows_usage() {
    fleetvisord().assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    fleetvisord()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = fleetvisord().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["serve", "action", "reset-password", "task", "instance", "new-password"] {
        assert!(output.contains(cmd), "help output should list '{cmd}' subcommand");
    }
}

#[test]
fn test_action_requires_a_verb() {
    fleetvisord()
        .args(["action", "user-1", "instance-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_action_rejects_unknown_verb() {
    fleetvisord()
        .args(["action", "user-1", "instance-1", "hibernate"])
        .assert()
        .failure();
}

#[test]
fn test_task_requires_a_task_id() {
    fleetvisord().arg("task").assert().failure();
}

#[test]
fn test_new_password_requires_both_ids() {
    fleetvisord().args(["new-password", "instance-1"]).assert().failure();
}

#[test]
fn test_task_lookup_fails_against_the_default_in_memory_store() {
    // No daemon has run yet (in-memory storage is per-process), so any task
    // id is unknown and the command should exit non-zero rather than panic.
    fleetvisord()
        .env_remove("DATABASE_URL")
        .args(["task", "nonexistent-task"])
        .assert()
        .failure();
}
