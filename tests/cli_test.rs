//! Integration tests for the `treesync` binary surface.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn treesync_bin() -> String {
    env!("CARGO_BIN_EXE_treesync").to_string()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(treesync_bin()).arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("sync"));
}

#[test]
fn test_sync_to_closed_port_fails() {
    let dir = TempDir::new().unwrap();
    let output = Command::new(treesync_bin())
        .args([
            "sync",
            "127.0.0.1",
            &free_port().to_string(),
            "alice",
            dir.path().to_str().unwrap(),
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to connect"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let output = Command::new(treesync_bin())
        .args([
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "serve",
            "--port",
            "0",
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.toml"), "stderr: {}", stderr);
}

#[test]
fn test_zero_timeout_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("treesync.toml"), "read_timeout_secs = 0\n").unwrap();

    let output = Command::new(treesync_bin())
        .args([
            "--config",
            dir.path().join("treesync.toml").to_str().unwrap(),
            "serve",
            "--port",
            "0",
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("read_timeout_secs"), "stderr: {}", stderr);
}
