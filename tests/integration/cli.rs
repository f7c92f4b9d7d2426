//! Integration tests for the `nodeflow` command line

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn nodeflow_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nodeflow"))
}

fn command(home: &TempDir) -> Command {
    let mut cmd = Command::new(nodeflow_bin());
    cmd.env("XDG_CONFIG_HOME", home.path())
        .env_remove("NODEFLOW_NODES")
        .env_remove("NODEFLOW_WORKERS")
        .env_remove("NODEFLOW_LOG");
    cmd
}

#[test]
fn test_config_reads_file_and_env() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("cluster.toml");
    fs::write(&file, "[cluster]\nnodes = 5\n\n[scheduler]\npolicy = \"fifo\"\n").unwrap();

    let output = command(&temp_dir)
        .arg("config")
        .arg("--config")
        .arg(&file)
        .env("NODEFLOW_WORKERS", "3")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("nodes = 5"));
    assert!(stdout.contains("policy = \"fifo\""));
    assert!(stdout.contains("workers = 3"));
}

#[test]
fn test_config_save() {
    let temp_dir = TempDir::new().unwrap();
    let output = command(&temp_dir)
        .args(["config", "--save"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let saved = temp_dir.path().join("nodeflow").join("config.toml");
    let content = fs::read_to_string(saved).unwrap();
    assert!(content.contains("[cluster]"));
    assert!(content.contains("hostname = \"localhost\""));
}

#[test]
fn test_bad_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("broken.toml");
    fs::write(&file, "[cluster\nnodes = ").unwrap();

    let output = command(&temp_dir)
        .args(["config", "--config"])
        .arg(&file)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"));
}

#[test]
fn test_demo_prints_counters() {
    let temp_dir = TempDir::new().unwrap();
    let output = command(&temp_dir)
        .args(["demo", "--nodes", "2", "--workers", "1", "--bytes", "4096"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 nodes, 4096 bytes, result verified"));
    assert!(stdout.contains("Node(0)"));
    assert!(stdout.contains("Node(1)"));
}
