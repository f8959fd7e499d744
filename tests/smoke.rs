//! Smoke tests -- verify the binary runs and the operator commands work.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("apiwatch.toml");
    let db = dir.join("apiwatch.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\n\n[rca]\napi_key = \"\"\n\n[logging]\nlevel = \"warn\"\n",
            db.to_string_lossy()
        ),
    )
    .unwrap();
    path
}

fn apiwatch(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("apiwatch").unwrap();
    cmd.env_remove("OPENAI_API_KEY").arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("apiwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Anomaly detection"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("apiwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("apiwatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["replay", "--help"],
        vec!["incidents", "list", "--help"],
        vec!["incidents", "ack", "--help"],
    ] {
        Command::cargo_bin("apiwatch").unwrap().args(&args).assert().success();
    }
}

#[test]
fn test_incidents_list_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    apiwatch(&config)
        .args(["incidents", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No incidents found."));
}

#[test]
fn test_invalid_filter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    apiwatch(&config)
        .args(["incidents", "list", "--status", "closed"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown status"));
}

#[test]
fn test_ack_unknown_incident_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    apiwatch(&config)
        .args(["incidents", "ack", "6f1d0b7e-2f4c-4d53-9b1a-0c4e8e2b7a11"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_replay_opens_contract_break_and_operator_flow() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    // First capture establishes schema v1.
    let first = dir.path().join("first.ndjson");
    std::fs::write(
        &first,
        "{\"method\":\"GET\",\"path\":\"/users\",\"statusCode\":200,\"latencyMs\":12,\"schemaFingerprint\":\"fp1\"}\n",
    )
    .unwrap();
    apiwatch(&config)
        .args(["replay", "--file"])
        .arg(&first)
        .assert()
        .success()
        .stdout(predicate::str::contains("Events accepted:    1"))
        .stdout(predicate::str::contains("Incidents raised:   0"));

    // Second capture changes the fingerprint and carries one bad line.
    let second = dir.path().join("second.ndjson");
    std::fs::write(
        &second,
        "{\"method\":\"GET\",\"path\":\"/users\",\"statusCode\":200,\"latencyMs\":15,\"schemaFingerprint\":\"fp2\"}\n\
         not json\n",
    )
    .unwrap();
    apiwatch(&config)
        .args(["replay", "--file"])
        .arg(&second)
        .assert()
        .success()
        .stdout(predicate::str::contains("Events rejected:    1"))
        .stdout(predicate::str::contains("Incidents raised:   1"));

    let output = apiwatch(&config)
        .args(["incidents", "list", "--type", "contract_break", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let list: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["severity"], "CRITICAL");
    let id = list[0]["id"].as_str().unwrap().to_string();

    apiwatch(&config)
        .args(["incidents", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("SCHEMA_CHANGE"))
        .stdout(predicate::str::contains("SKIPPED"));

    apiwatch(&config).args(["incidents", "ack", &id]).assert().success();
    apiwatch(&config)
        .args(["incidents", "ack", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("only OPEN incidents"));
    apiwatch(&config)
        .args(["incidents", "resolve", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("resolved"));
}
