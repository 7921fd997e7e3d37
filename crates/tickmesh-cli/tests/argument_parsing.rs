//! Focused CLI argument parsing tests.
//!
//! Tests that verify command-line parsing and the offline commands without
//! long-running clusters.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use std::io::Write;
use std::net::TcpListener;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use tickmesh_types::{Direction, EventRecord, LogEntry, LogicalTime, MachineId};

/// A `tickmesh` command isolated from the user's config directory.
fn tickmesh(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tickmesh").unwrap();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env_remove("RUST_LOG")
        .arg("--project")
        .arg(home.path())
        .arg("--no-color");
    cmd
}

fn write_log(dir: &Path, machine: u32, events: Vec<EventRecord>) {
    let id = MachineId::new(machine).unwrap();
    let mut file = std::fs::File::create(dir.join(id.log_file_name())).unwrap();
    for event in events {
        writeln!(
            file,
            "{}",
            serde_json::to_string(&LogEntry::now(id, event)).unwrap()
        )
        .unwrap();
    }
}

fn startup(port: u16, peers: &[u32]) -> EventRecord {
    EventRecord::Startup {
        port,
        clock_rate: 100,
        peers: peers.iter().map(|&p| MachineId::new(p).unwrap()).collect(),
    }
}

/// Two consecutive free ports.
fn free_port_pair() -> u16 {
    (20_000..60_000)
        .step_by(7)
        .find(|&p| {
            TcpListener::bind(("127.0.0.1", p)).is_ok()
                && TcpListener::bind(("127.0.0.1", p + 1)).is_ok()
        })
        .unwrap()
}

// ============================================================================
// Commands That Work Without a Cluster
// ============================================================================

#[test]
fn version_command_succeeds() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tickmesh"));
}

#[test]
fn version_flag_shows_version() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tickmesh"));
}

#[test]
fn help_flag_shows_usage() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Lamport"));
}

#[test]
fn config_prints_defaults_as_toml() {
    let home = TempDir::new().unwrap();
    tickmesh(&home)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[network]"))
        .stdout(predicate::str::contains("base_port = 5000"));
}

#[test]
fn config_honors_project_file_and_env() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("tickmesh.toml"),
        "[network]\nmachines = 4\n",
    )
    .unwrap();

    tickmesh(&home)
        .env("TICKMESH_NETWORK__BASE_PORT", "6100")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("machines = 4"))
        .stdout(predicate::str::contains("base_port = 6100"));
}

#[test]
fn analyze_prints_statistics() {
    let home = TempDir::new().unwrap();
    let logs = home.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    write_log(
        &logs,
        1,
        vec![
            startup(5000, &[2]),
            EventRecord::Receive {
                sender: MachineId::new(2).unwrap(),
                old_clock: LogicalTime::new(0),
                sender_clock: LogicalTime::new(4),
                new_clock: LogicalTime::new(5),
                drift: 4,
                queue_length: 2,
            },
        ],
    );

    tickmesh(&home)
        .arg("analyze")
        .arg(&logs)
        .assert()
        .success()
        .stdout(predicate::str::contains("Max drift"))
        .stdout(predicate::str::contains("Machine 1 (clock rate 100)"));

    tickmesh(&home)
        .args(["analyze", "--json"])
        .arg(&logs)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_drift\": 4"));
}

#[test]
fn verify_fails_on_wrong_connections() {
    let home = TempDir::new().unwrap();
    let logs = home.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    write_log(
        &logs,
        2,
        vec![
            startup(5001, &[1]),
            EventRecord::Connected {
                peer: MachineId::new(1).unwrap(),
                port: 5000,
                direction: Direction::Dialed,
            },
        ],
    );

    tickmesh(&home)
        .arg("verify")
        .arg(&logs)
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAIL"));
}

#[test]
fn analyze_missing_directory_fails() {
    let home = TempDir::new().unwrap();
    tickmesh(&home)
        .args(["analyze"])
        .arg(home.path().join("absent"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read logs"));
}

// ============================================================================
// Argument Parsing Errors
// ============================================================================

#[test]
fn no_command_shows_help() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn machine_requires_port() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .args(["machine", "--peers", "5001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--port"));
}

#[test]
fn invalid_peer_list_is_rejected() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .args(["machine", "--port", "5000", "--peers", "5001,abc"])
        .assert()
        .failure();
}

#[test]
fn run_rejects_zero_machines() {
    let home = TempDir::new().unwrap();
    tickmesh(&home)
        .args(["run", "--machines", "0", "--duration", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid run options"));
}

#[test]
fn run_rejects_mismatched_clock_rates() {
    let home = TempDir::new().unwrap();
    tickmesh(&home)
        .args(["run", "--machines", "3", "--clock-rates", "1,2", "--duration", "1"])
        .assert()
        .failure();
}

#[test]
fn unknown_log_format_is_rejected() {
    Command::cargo_bin("tickmesh")
        .unwrap()
        .args(["--log-format", "xml", "config"])
        .assert()
        .failure();
}

// ============================================================================
// Short Cluster Runs
// ============================================================================

#[test]
fn short_run_writes_verifiable_logs() {
    let home = TempDir::new().unwrap();
    let logs = home.path().join("run-logs");
    let base_port = free_port_pair().to_string();

    tickmesh(&home)
        .args(["run", "--fast", "--machines", "2", "--duration", "3"])
        .args(["--clock-rates", "20,30", "--seed", "7"])
        .args(["--base-port", base_port.as_str()])
        .arg("--log-dir")
        .arg(&logs)
        .assert()
        .success()
        .stdout(predicate::str::contains("Logs written to"));

    assert!(logs.join("machine_1.log").exists());
    assert!(logs.join("machine_2.log").exists());

    tickmesh(&home)
        .arg("verify")
        .arg(&logs)
        .assert()
        .success()
        .stdout(predicate::str::contains("checks passed"));
}
