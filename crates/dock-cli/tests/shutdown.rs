//! Integration tests for graceful shutdown of `dock serve`.
//! Verifies that closing stdin (EOF) and sending signals cause clean exit
//! after in-flight snapshots are drained.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BASE: i64 = 1_771_632_000;

fn dock_binary() -> std::path::PathBuf {
    assert_cmd::cargo::cargo_bin!("dock").into()
}

fn register_gateway(data_dir: &TempDir) {
    let status = Command::new(dock_binary())
        .args(["gateway", "add", "GW-1", "--org", "org-1", "--location", "L1"])
        .env("DOCK_DATA_DIR", data_dir.path())
        .env_remove("DOCK_CONFIG")
        .status()
        .expect("failed to register gateway");
    assert!(status.success());
}

fn spawn_serve(data_dir: &TempDir) -> std::process::Child {
    Command::new(dock_binary())
        .arg("serve")
        .env("DOCK_DATA_DIR", data_dir.path())
        .env_remove("DOCK_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn dock serve")
}

/// Wait for the pidfile to appear, indicating the intake has started.
fn wait_for_pidfile(data_dir: &TempDir) {
    let pidfile = data_dir.path().join("dock-serve.pid");
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pidfile.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn send_sightings(child: &mut std::process::Child, count: i64) {
    let stdin = child.stdin.as_mut().expect("stdin pipe");
    for i in 0..count {
        let line = serde_json::json!({
            "gatewayId": "GW-1",
            "capturedAtEpochSeconds": BASE + i,
            "readings": [{ "tagId": "A1", "signalStrengthDbm": -60 }],
        });
        writeln!(stdin, "{line}").unwrap();
    }
    stdin.flush().unwrap();
}

#[test]
fn serve_exits_on_immediate_stdin_eof() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_serve(&dir);
    wait_for_pidfile(&dir);

    drop(child.stdin.take());

    let start = Instant::now();
    let output = child.wait_with_output().expect("wait");
    let elapsed = start.elapsed();

    assert!(
        output.status.success(),
        "stdin EOF should exit 0, got {}",
        output.status
    );
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("accepted=0"), "{stdout}");
}

/// Lines written before EOF are all processed before exit.
#[test]
fn serve_drains_before_exit() {
    let dir = TempDir::new().unwrap();
    register_gateway(&dir);
    let mut child = spawn_serve(&dir);
    wait_for_pidfile(&dir);

    send_sightings(&mut child, 5);
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success(), "exit {}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("accepted=5"), "{stdout}");
    assert!(stdout.contains("movements=1"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn serve_exits_on_sigterm_with_stdin_open() {
    let dir = TempDir::new().unwrap();
    register_gateway(&dir);
    let mut child = spawn_serve(&dir);
    wait_for_pidfile(&dir);
    send_sightings(&mut child, 3);
    std::thread::sleep(Duration::from_millis(300));

    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let start = Instant::now();
    let status = child.wait().expect("wait");
    let elapsed = start.elapsed();

    assert!(status.success(), "SIGTERM should exit 0, got {status}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn pidfile_created_and_removed_on_exit() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("dock-serve.pid");

    let mut child = spawn_serve(&dir);
    wait_for_pidfile(&dir);

    assert!(pidfile.exists(), "pidfile should exist while serving");

    let content = std::fs::read_to_string(&pidfile).unwrap();
    let file_pid: u32 = content
        .trim()
        .parse()
        .expect("pidfile should contain a PID");
    assert_eq!(file_pid, child.id(), "pidfile PID should match child PID");

    drop(child.stdin.take());
    child.wait().expect("wait");

    assert!(
        !pidfile.exists(),
        "pidfile should be removed after clean shutdown"
    );
}

#[test]
fn wal_checkpoint_on_exit() {
    let dir = TempDir::new().unwrap();
    register_gateway(&dir);
    let mut child = spawn_serve(&dir);
    wait_for_pidfile(&dir);

    send_sightings(&mut child, 4);
    drop(child.stdin.take());
    child.wait().expect("wait");

    let wal_path = dir.path().join("dock.db-wal");
    if wal_path.exists() {
        let wal_size = std::fs::metadata(&wal_path).unwrap().len();
        assert_eq!(
            wal_size, 0,
            "WAL should be empty after TRUNCATE checkpoint, was {wal_size} bytes"
        );
    }
}
