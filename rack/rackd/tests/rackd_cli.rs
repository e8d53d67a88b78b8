use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

const CATALOG: &str = r#"[
    {"type": "motherboard", "id": "mb-1", "spec": {
        "kind": "motherboard", "socket": "AM5", "socket_count": 1,
        "memory_types": ["DDR5"], "dimm_slots": 2,
        "pcie_slots": [{"width": "x16", "count": 1}]
    }},
    {"type": "cpu", "id": "cpu-1", "spec": {"kind": "cpu", "socket": "AM5", "memory_types": ["DDR5"]}},
    {"type": "cpu", "id": "cpu-intel", "spec": {"kind": "cpu", "socket": "LGA1700"}},
    {"type": "ram", "id": "ram-1", "notes": "16GB DDR5 5600MHz"},
    {"type": "nic", "id": "nic-1", "spec": {"kind": "expansion", "pcie_width": "x8"}}
]"#;

fn rackd(dir: &Path, args: &[&str]) -> (i32, Value) {
    let output = Command::cargo_bin("rackd")
        .unwrap()
        .env_remove("RACK_CONFIG")
        .arg("--catalog")
        .arg(dir.join("catalog.json"))
        .arg("--state")
        .arg(dir.join("state.json"))
        .args(args)
        .output()
        .unwrap();
    let code = output.status.code().unwrap_or(-1);
    let body = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
    (code, body)
}

fn setup() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("catalog.json"), CATALOG).unwrap();
    dir
}

#[test]
fn assemble_validate_and_finalize() {
    let dir = setup();
    let path = dir.path();

    let (code, created) = rackd(path, &["create", "web-01", "--name", "web tier"]);
    assert_eq!(code, 0);
    assert_eq!(created["status"], "draft");

    for (kind, id) in [("motherboard", "mb-1"), ("cpu", "cpu-1"), ("ram", "ram-1")] {
        let (code, _) = rackd(path, &["add", "web-01", kind, id]);
        assert_eq!(code, 0, "adding {kind}:{id}");
    }
    let (code, added) = rackd(path, &["add", "web-01", "nic", "nic-1"]);
    assert_eq!(code, 0);
    assert_eq!(added["assigned_slot"], "pcie-x16-1");

    let (code, refused) = rackd(path, &["add", "web-01", "cpu", "cpu-intel"]);
    assert_eq!(code, 2);
    assert_eq!(refused["kind"], "compatibility_blocked");

    let (code, report) = rackd(path, &["validate", "web-01"]);
    assert_eq!(code, 0);
    assert_eq!(report["valid"], true);
    assert_eq!(report["status"], "validated");

    let (code, receipt) = rackd(path, &["finalize", "web-01"]);
    assert_eq!(code, 0);
    assert_eq!(receipt["config"], "web-01");

    let (code, denied) = rackd(path, &["remove", "web-01", "nic", "nic-1", "--elevated"]);
    assert_eq!(code, 2);
    assert_eq!(denied["kind"], "permission_denied");

    let (code, journal) = rackd(path, &["journal", "--component", "nic:nic-1"]);
    assert_eq!(code, 0);
    assert_eq!(journal.as_array().map(Vec::len), Some(1));
}

#[test]
fn test_mode_cannot_finalize() {
    let dir = setup();
    let path = dir.path();
    rackd(path, &["create", "trial", "--mode", "test"]);
    for (kind, id) in [("motherboard", "mb-1"), ("cpu", "cpu-1"), ("ram", "ram-1")] {
        rackd(path, &["add", "trial", kind, id]);
    }
    let (code, rows) = rackd(path, &["components"]);
    assert_eq!(code, 0);
    let in_use = rows
        .as_array()
        .unwrap()
        .iter()
        .filter(|r| r["status"] == "in_use")
        .count();
    assert_eq!(in_use, 0);

    let (code, refused) = rackd(path, &["finalize", "trial"]);
    assert_eq!(code, 2);
    assert_eq!(refused["kind"], "validation_failed");
}

#[test]
fn candidates_and_conflicts_across_runs() {
    let dir = setup();
    let path = dir.path();
    rackd(path, &["create", "a"]);
    rackd(path, &["create", "b"]);
    rackd(path, &["add", "a", "motherboard", "mb-1"]);

    let (code, candidates) = rackd(path, &["candidates", "a", "cpu"]);
    assert_eq!(code, 0);
    let ids: Vec<&str> = candidates
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["component"]["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["cpu-1"]);

    let (code, conflict) = rackd(path, &["add", "b", "motherboard", "mb-1"]);
    assert_eq!(code, 2);
    assert_eq!(conflict["kind"], "conflict");

    let (code, _) = rackd(path, &["delete", "a"]);
    assert_eq!(code, 0);
    let (code, _) = rackd(path, &["add", "b", "motherboard", "mb-1"]);
    assert_eq!(code, 0);
}

#[test]
fn missing_configuration_is_not_found() {
    let dir = setup();
    let (code, body) = rackd(dir.path(), &["pool", "ghost"]);
    assert_eq!(code, 2);
    assert_eq!(body["kind"], "not_found");
}

#[test]
fn quantity_above_the_limit_is_refused() {
    let dir = setup();
    let path = dir.path();
    rackd(path, &["create", "bulk"]);
    let (code, refused) = rackd(path, &["add", "bulk", "cpu", "cpu-1", "-q", "40000000"]);
    assert_eq!(code, 2);
    assert_eq!(refused["kind"], "validation_failed");

    fs::write(path.join("engine.json"), r#"{"max_quantity": 100000000}"#).unwrap();
    let config = path.join("engine.json");
    let config = config.to_str().unwrap();
    let (code, added) = rackd(path, &["--config", config, "add", "bulk", "cpu", "cpu-1", "-q", "40000000"]);
    assert_eq!(code, 0);
    assert_eq!(added["association"]["quantity"], 40000000);
}
