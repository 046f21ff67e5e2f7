//! CLI smoke tests for the bundled worker binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn stoker_worker() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("stoker-worker").unwrap()
}

#[test]
fn help_describes_fault_injection_flags() {
    stoker_worker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("stop-after"))
        .stdout(predicate::str::contains("skip-handshake"))
        .stdout(predicate::str::contains("handshake-delay-ms"));
}

#[test]
fn version_prints_and_exits() {
    stoker_worker()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stoker-worker"));
}

#[test]
fn rejects_unknown_flags() {
    stoker_worker()
        .arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}
