use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn isoprov() -> assert_cmd::Command {
    cargo_bin_cmd!("isoprov").into()
}

const BASE: &str = r#"
[installer]
boot_line = "vmlinuz rootwait console=ttyS0,115200"

[credentials]
password = "St8rlingX*"

[temp_network]
address = "10.10.10.3"
interface = "enp2s1"
gateway = "10.10.10.1"
"#;

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("isoprov.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(f, "{body}").unwrap();
    config_path
}

fn with_controller(memory_mb: u64, cores: u32) -> String {
    format!(
        r#"{BASE}
[[configurations]]
[configurations.controller]
partition_a_gb = 1
partition_b_gb = 1
memory_mb = {memory_mb}
cores = {cores}
"#
    )
}

#[test]
fn help_works() {
    isoprov()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("installer ISO"));
}

#[test]
fn up_requires_an_iso() {
    isoprov()
        .arg("up")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--iso"));
}

#[test]
fn missing_config_shows_error() {
    isoprov()
        .args(["--config", "/nonexistent/isoprov.toml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_rejects_config_without_configurations() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, BASE);

    isoprov()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[[configurations]]"));
}

#[test]
fn check_reports_memory_overcommit_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &with_controller(u64::from(u32::MAX), 1));

    isoprov()
        .args(["--config", config_path.to_str().unwrap(), "--output", "json", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("memory defined in the plan"));
}

#[test]
fn check_rejects_zero_core_node() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &with_controller(1, 0));

    isoprov()
        .args(["--config", config_path.to_str().unwrap(), "--output", "json", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("controller-0: must have assigned at least 1 core"));
}

#[test]
fn log_without_transcripts() {
    let dir = tempfile::tempdir().unwrap();

    isoprov()
        .env("XDG_DATA_HOME", dir.path())
        .args(["log", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No console transcripts found."));
}

#[test]
fn log_shows_latest_failed_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("isoprov/logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(
        logs.join("2026-01-01T00-00-00_console-controller-0_failed.log"),
        "Loading vmlinuz\n[isoprov] phase 'wait-for-kernel' timed out\n",
    )
    .unwrap();
    std::fs::write(
        logs.join("2026-01-02T00-00-00_console-controller-0_ok.log"),
        "localhost login:\n",
    )
    .unwrap();

    isoprov()
        .env("XDG_DATA_HOME", dir.path())
        .args(["log", "--failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_console-controller-0_failed.log"))
        .stdout(predicate::str::contains("timed out"));
}
