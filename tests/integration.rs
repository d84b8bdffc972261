//! Integration tests for the curfew binary.
//!
//! Tests that touch the real filter table require root and are marked
//! with #[ignore]. Run with: `sudo cargo test --release -- --ignored`

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;

fn get_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_curfew"))
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn run_curfew(args: &[&str]) -> std::process::Output {
    Command::new(get_binary_path())
        .args(args)
        .output()
        .expect("Failed to execute curfew")
}

/// Config file pointing at a temporary target list.
fn temp_setup(config_extra: &str, targets: &str) -> (NamedTempFile, NamedTempFile) {
    let mut targets_file = NamedTempFile::new().unwrap();
    targets_file.write_all(targets.as_bytes()).unwrap();

    let mut config = NamedTempFile::new().unwrap();
    write!(
        config,
        "targets_file: {}\n{}",
        targets_file.path().display(),
        config_extra
    )
    .unwrap();
    (config, targets_file)
}

#[test]
fn test_version_command() {
    let output = run_curfew(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("curfew"));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_command() {
    let output = run_curfew(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("apply"));
}

#[test]
fn test_run_help_lists_overrides() {
    let output = run_curfew(&["run", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--endpoint", "--cert", "--key", "--topic", "--port", "--targets"] {
        assert!(stdout.contains(flag), "missing {} in run --help", flag);
    }
}

#[test]
fn test_invalid_command() {
    let output = run_curfew(&["frobnicate"]);
    assert!(!output.status.success());
}

#[test]
fn test_run_without_endpoint_fails() {
    let (config, _targets) = temp_setup("", "10.0.0.5\n");
    let output = run_curfew(&["run", "--config", config.path().to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("endpoint"), "stderr: {}", stderr);
}

#[test]
fn test_run_with_invalid_schedule_fails() {
    let (config, _targets) = temp_setup(
        "broker:\n  endpoint: broker.example.com\nschedule:\n  block_at: \"25:00\"\n",
        "10.0.0.5\n",
    );
    let output = run_curfew(&["run", "--config", config.path().to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_run_with_missing_certificates_fails() {
    if !is_root() {
        eprintln!("Skipping test_run_with_missing_certificates_fails: requires root");
        return;
    }
    let (config, _targets) = temp_setup(
        "broker:\n  endpoint: broker.example.com\n  cert: /nonexistent/dev.crt\n",
        "10.0.0.5\n",
    );
    let output = run_curfew(&["run", "--config", config.path().to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("certificate"), "stderr: {}", stderr);
}

#[test]
fn test_apply_malformed_payload() {
    let output = run_curfew(&["apply", r#"{"foo":"bar"}"#]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid payload"));
}

#[test]
fn test_apply_unknown_command() {
    let output = run_curfew(&["apply", r#"{"command":"reboot"}"#]);
    assert!(!output.status.success());
}

#[test]
fn test_status_does_not_crash_without_privileges() {
    let (config, _targets) = temp_setup("", "10.0.0.5\n10.0.0.6\n");
    let output = run_curfew(&["status", "--config", config.path().to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Schedule window: 00:00-06:00"));
    assert!(stdout.contains("Targets: 2"));
}

#[test]
#[ignore] // Requires root and iptables
fn test_apply_block_then_unblock() {
    if !is_root() {
        eprintln!("Skipping test_apply_block_then_unblock: requires root");
        return;
    }

    // TEST-NET-1, never a real client
    let (config, _targets) = temp_setup("", "192.0.2.77\n");
    let config_path = config.path().to_str().unwrap();

    let output = run_curfew(&[
        "apply",
        "--config",
        config_path,
        r#"{"ip":"0.0.0.0","status":"block"}"#,
    ]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("192.0.2.77"));

    // a second block must not duplicate rules
    let output = run_curfew(&[
        "apply",
        "--config",
        config_path,
        r#"{"ip":"192.0.2.77","status":"BLOCK"}"#,
    ]);
    assert!(output.status.success());

    let output = run_curfew(&[
        "apply",
        "--config",
        config_path,
        r#"{"ip":"0.0.0.0","status":"unblock"}"#,
    ]);
    assert!(output.status.success());
    assert!(!String::from_utf8_lossy(&output.stdout).contains("192.0.2.77"));
}

#[test]
#[ignore] // Requires root
fn test_concurrent_daemon_lock() {
    if !is_root() {
        eprintln!("Skipping test_concurrent_daemon_lock: requires root");
        return;
    }

    let (config, _targets) = temp_setup(
        "broker:\n  endpoint: 127.0.0.1\n  port: 1\n",
        "192.0.2.77\n",
    );
    let config_path = config.path().to_str().unwrap().to_string();

    let _held = curfew::lock::LockGuard::acquire().unwrap();
    let output = run_curfew(&["run", "--config", &config_path]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already running"), "stderr: {}", stderr);
}
