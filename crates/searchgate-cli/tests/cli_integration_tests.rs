//! CLI integration tests for searchgate
//!
//! Runs the binary against a throwaway config directory; nothing here needs a
//! live search backend.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated in its own config directory
#[allow(deprecated)]
fn searchgate_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("searchgate").unwrap();
    cmd.env("SEARCHGATE_CONFIG_DIR", config_dir.path());
    cmd.env_remove("SEARCHGATE_BACKEND_PASSWORD");
    cmd.env("RUST_LOG", "error");
    cmd
}

fn write_sources(config_dir: &TempDir) {
    std::fs::write(
        config_dir.path().join("config.toml"),
        r#"
[search]
backend = "opensearch"
url = "http://127.0.0.1:9"
request_timeout_secs = 2
retry_max_attempts = 1

[[sources]]
entity_type = "sales_Order"
table = "orders"
name_column = "number"
fields = ["comment"]
"#,
    )
    .unwrap();
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("queue"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn test_config_set_and_get() {
    let dir = TempDir::new().unwrap();

    searchgate_cmd(&dir)
        .args(["config", "set", "queue.batch_size", "25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set queue.batch_size = 25"));

    searchgate_cmd(&dir)
        .args(["config", "get", "queue.batch_size"])
        .assert()
        .success()
        .stdout(predicate::str::diff("25\n"));

    assert!(dir.path().join("config.toml").exists());
}

#[test]
fn test_config_rejects_password() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["config", "set", "search.password", "hunter2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SEARCHGATE_BACKEND_PASSWORD"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["config", "set", "queue.batch_size", "0"])
        .assert()
        .failure();
    searchgate_cmd(&dir)
        .args(["config", "set", "search.backend", "solr"])
        .assert()
        .failure();
}

#[test]
fn test_config_list_json() {
    let dir = TempDir::new().unwrap();
    let output = searchgate_cmd(&dir)
        .args(["config", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let values: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(values["queue.batch_size"], "100");
    assert_eq!(values["search.backend"], "elasticsearch");
}

#[test]
fn test_queue_status_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["queue", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue depth: 0"))
        .stdout(predicate::str::contains("Drain lease: available"));

    assert!(dir.path().join("searchgate.db").exists());
}

#[test]
fn test_queue_status_json() {
    let dir = TempDir::new().unwrap();
    let output = searchgate_cmd(&dir)
        .args(["queue", "status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["depth"], 0);
    assert!(status["drain_lease"].is_null());
}

#[test]
fn test_worker_once_with_empty_queue() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["worker", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed 0 item(s)"));
}

#[test]
fn test_queue_drain_with_empty_queue() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["queue", "drain", "--batch-size", "10", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"processed\": 0"));
}

#[test]
fn test_reindex_unknown_type_fails_with_code() {
    let dir = TempDir::new().unwrap();
    searchgate_cmd(&dir)
        .args(["queue", "reindex", "hr_Employee"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E002"))
        .stderr(predicate::str::contains("hr_Employee"));
}

#[test]
fn test_search_rejects_unknown_strategy() {
    let dir = TempDir::new().unwrap();
    write_sources(&dir);
    searchgate_cmd(&dir)
        .args(["search", "acme", "--strategy", "fuzzy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E101"));
}

#[test]
fn test_search_rejects_zero_page_size() {
    let dir = TempDir::new().unwrap();
    write_sources(&dir);
    searchgate_cmd(&dir)
        .args(["search", "acme", "--page-size", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E800"));
}

#[test]
fn test_doctor_reports_unreachable_backend() {
    let dir = TempDir::new().unwrap();
    write_sources(&dir);
    let output = searchgate_cmd(&dir)
        .args(["doctor", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], false);
    let checks = report["checks"].as_array().unwrap();
    let check = |name: &str| {
        checks
            .iter()
            .find(|c| c["name"] == name)
            .unwrap_or_else(|| panic!("missing check {}", name))
            .clone()
    };
    assert_eq!(check("configuration")["ok"], true);
    assert_eq!(check("database")["ok"], true);
    assert_eq!(check("backend")["ok"], false);
}
