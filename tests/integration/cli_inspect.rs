#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use gentree::{
    GenTree, NoopMonitor, Pager, PagerOptions, RecoveryCoordinator, TreeOptions, U64Layout,
};
use serde_json::Value;
use tempfile::TempDir;

fn seed_store(dir: &Path, close: bool) -> PathBuf {
    let path = dir.join("inspect.gt");
    let pager = Pager::open(
        &path,
        PagerOptions {
            page_size: 1024,
            ..PagerOptions::default()
        },
    )
    .expect("pager");
    let tree = GenTree::open(
        Arc::new(pager),
        U64Layout,
        TreeOptions {
            node_capacity: Some(8),
        },
        |payload: &mut Vec<u8>| payload.extend_from_slice(b"index-42"),
        &RecoveryCoordinator::immediate(),
        Arc::new(NoopMonitor),
    )
    .expect("open");
    for key in 0..300u64 {
        tree.insert(key, key).expect("insert");
    }
    if close {
        tree.close().expect("close");
    } else {
        tree.checkpoint().expect("checkpoint");
        tree.insert(5, 55).expect("insert");
        tree.store().flush().expect("flush");
    }
    path
}

fn json_of(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("gentree-inspect")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn info_reports_meta_and_current_state() {
    let dir = TempDir::new().expect("tempdir");
    let path = seed_store(dir.path(), true);
    let json = json_of(&["info"], &path);

    assert_eq!(json["meta"]["page_size"], 1024);
    assert_eq!(json["meta"]["layout_tag"], "gt.u64");
    assert_eq!(json["meta"]["leaf_capacity"], 8);
    let states = json["states"].as_array().expect("states");
    assert_eq!(states.len(), 2);
    let current: Vec<&Value> = states.iter().filter(|s| s["current"] == true).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0]["clean"], true);
    assert_eq!(current[0]["payload_text"], "index-42");
}

#[test]
fn info_text_mentions_header() {
    let dir = TempDir::new().expect("tempdir");
    let path = seed_store(dir.path(), true);
    let output = cargo_bin_cmd!("gentree-inspect")
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("index-42"), "{text}");
    assert!(text.contains("(current)"), "{text}");
}

#[test]
fn verify_passes_on_a_clean_store() {
    let dir = TempDir::new().expect("tempdir");
    let path = seed_store(dir.path(), true);
    let json = json_of(&["verify"], &path);
    assert_eq!(json["success"], true);
    assert_eq!(json["counts"]["entries"], 300);
    assert_eq!(json["counts"]["crash_pointers"], 0);
}

#[test]
fn verify_warns_about_crash_pointers() {
    let dir = TempDir::new().expect("tempdir");
    let path = seed_store(dir.path(), false);
    let json = json_of(&["verify"], &path);
    assert_eq!(json["success"], true);
    assert_eq!(json["counts"]["entries"], 300);
    assert!(json["counts"]["crash_pointers"].as_u64().expect("count") > 0);
    let findings = json["findings"].as_array().expect("findings");
    assert!(findings.iter().any(|f| f["severity"] == "warning"));
}

#[test]
fn verify_with_wrong_layout_fails() {
    let dir = TempDir::new().expect("tempdir");
    let path = seed_store(dir.path(), true);
    cargo_bin_cmd!("gentree-inspect")
        .args(["verify", "--layout", "number"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn missing_store_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("gentree-inspect")
        .arg("info")
        .arg(dir.path().join("nope.gt"))
        .assert()
        .failure();
}
