use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use docvault::cluster::MemoryCluster;

fn docvault(archive: &Path) -> Command {
    let mut cmd = Command::cargo_bin("docvault").unwrap();
    cmd.env_remove("DOCVAULT_ARCHIVE")
        .env_remove("RUST_LOG")
        .arg("--archive")
        .arg(archive);
    cmd
}

fn seed_cluster(dir: &Path, docs: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let cluster = MemoryCluster::open(dir).unwrap();
    cluster.create_couchbase_bucket("default").unwrap();
    cluster.load_documents("default", "doc", docs).unwrap();
    cluster.save().unwrap();
}

fn endpoint(dir: &Path) -> String {
    format!("file://{}", dir.display())
}

#[test]
fn test_help() {
    Command::cargo_bin("docvault")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("backup"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("merge"));
}

#[test]
fn test_missing_archive_fails() {
    let temp = TempDir::new().unwrap();
    docvault(&temp.path().join("nowhere"))
        .args(["list", "-r", "nightly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Archive not found"));
}

#[test]
fn test_backup_restore_round_trip() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("archive");
    let cluster_dir = temp.path().join("cluster");
    seed_cluster(&cluster_dir, 1000);

    docvault(&archive)
        .args(["config", "-r", "nightly"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Repository 'nightly' is ready."));

    docvault(&archive)
        .args(["backup", "-r", "nightly", "-c", &endpoint(&cluster_dir)])
        .args(["-p", "password", "--threads", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1000 document(s)"));

    docvault(&archive)
        .args(["list", "-r", "nightly"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1000"));

    let output = docvault(&archive)
        .args(["info", "-r", "nightly", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["default"]["num_docs"], 1000);

    let cluster = MemoryCluster::open(&cluster_dir).unwrap();
    cluster.delete_all_buckets();
    cluster.save().unwrap();

    docvault(&archive)
        .args(["restore", "-r", "nightly", "-c", &endpoint(&cluster_dir)])
        .env("DOCVAULT_PASSWORD", "password")
        .assert()
        .success()
        .stdout(predicate::str::contains("(created)"));

    let cluster = MemoryCluster::open(&cluster_dir).unwrap();
    assert_eq!(cluster.item_count("default").unwrap(), 1000);
    assert!(archive.join("logs").join("docvault.log").exists());
}

#[test]
fn test_wrong_password_exits_non_zero() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("archive");
    let cluster_dir = temp.path().join("cluster");
    seed_cluster(&cluster_dir, 10);

    docvault(&archive)
        .args(["config", "-r", "nightly"])
        .assert()
        .success();

    docvault(&archive)
        .args(["backup", "-r", "nightly", "-c", &endpoint(&cluster_dir)])
        .args(["-p", "wrong"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("HTTP 401"));
}

#[test]
fn test_conflicting_bucket_lists_rejected() {
    let temp = TempDir::new().unwrap();
    docvault(&temp.path().join("archive"))
        .args(["config", "-r", "nightly"])
        .args(["--include-buckets", "a", "--exclude-buckets", "b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_info_on_empty_repository() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("archive");
    docvault(&archive)
        .args(["config", "-r", "nightly"])
        .assert()
        .success();

    docvault(&archive)
        .args(["info", "-r", "nightly"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No buckets backed up."));

    docvault(&archive)
        .args(["info", "--format", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("name: nightly"));
}

#[test]
fn test_merge_takes_no_cluster_arguments() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("archive");
    docvault(&archive)
        .args(["config", "-r", "nightly"])
        .assert()
        .success();

    Command::cargo_bin("docvault")
        .unwrap()
        .args(["merge", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--start"))
        .stdout(predicate::str::contains("--cluster").not());

    // Runs against the archive alone, with no password in the environment
    docvault(&archive)
        .env_remove("DOCVAULT_PASSWORD")
        .args(["merge", "-r", "nightly", "--start", "a", "--end", "b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Backup instance not found"));
}
