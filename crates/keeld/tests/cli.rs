//! `keeld validate` / `keeld defaults` against real config files.

use std::process::Command;

fn keeld() -> Command {
    Command::new(env!("CARGO_BIN_EXE_keeld"))
}

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn validate_accepts_full_config() {
    let (_dir, path) = write_config(
        r#"
[pipeline]
severity_threshold = "critical"
supersede = "cancel"

[pipeline.retry]
max_attempts = 3
base_delay = "250ms"

[reconcile]
interval = "1m"
prune = false

[[reconcile.sets]]
name = "prod"
workloads = ["api", "worker"]
prune = true

[autoscale]
cooldown = "2m"

[platform]
timeout = "15s"
observe = ["keel-platform", "observe"]
apply = ["keel-platform", "apply"]
delete = ["keel-platform", "delete"]
health = ["keel-platform", "health"]
scale = ["keel-platform", "scale"]
load = ["keel-platform", "load"]

[[workloads]]
name = "api"
artifact = "registry.local/api"

[[workloads]]
name = "worker"
artifact = "registry.local/worker"
"#,
    );

    let output = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 workloads, 1 sync sets"), "{stdout}");
}

#[test]
fn validate_accepts_empty_config() {
    let (_dir, path) = write_config("");
    let status = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn validate_rejects_undeclared_workload() {
    let (_dir, path) = write_config(
        r#"
[[reconcile.sets]]
name = "prod"
workloads = ["api"]
"#,
    );
    let output = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("undeclared workload api"));
}

#[test]
fn validate_rejects_single_tick_stabilization() {
    let (_dir, path) = write_config(
        r#"
[autoscale]
stabilization_ticks = 1
"#,
    );
    let output = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("stabilization_ticks"));
}

#[test]
fn validate_rejects_bad_duration() {
    let (_dir, path) = write_config(
        r#"
[reconcile]
wave_timeout = "soon"
"#,
    );
    let status = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn validate_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = keeld()
        .args(["validate", "--config"])
        .arg(dir.path().join("absent.toml"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load"));
}

#[test]
fn defaults_round_trip_through_validate() {
    let output = keeld().arg("defaults").output().unwrap();
    assert!(output.status.success());
    let defaults = String::from_utf8(output.stdout).unwrap();
    assert!(defaults.contains("severity_threshold"));

    let (_dir, path) = write_config(&defaults);
    let status = keeld()
        .args(["validate", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());
}
