use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn traffic_gen(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rusts-traffic-gen"))
        .current_dir(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to launch rusts-traffic-gen")
}

#[test]
fn unreachable_cluster_exits_with_status_one() {
    let dir = TempDir::new().unwrap();

    // Nothing listens on port 1, so the control connection is refused
    let output = traffic_gen(dir.path(), &["--hosts", "127.0.0.1:1", "--duration", "1"]);

    assert_eq!(output.status.code(), Some(1));
    let log = std::fs::read_to_string(dir.path().join("telemetry.log")).unwrap();
    assert!(log.contains("Initial connection failed"), "log was: {}", log);
}

#[test]
fn generate_config_writes_the_default_file() {
    let dir = TempDir::new().unwrap();

    let output = traffic_gen(dir.path(), &["--generate-config"]);

    assert!(output.status.success());
    let content = std::fs::read_to_string(dir.path().join("traffic.yml")).unwrap();
    assert!(content.contains("fault_probability"));
}

#[test]
fn invalid_fault_probability_is_rejected() {
    let dir = TempDir::new().unwrap();

    let output = traffic_gen(
        dir.path(),
        &["--backend", "memory", "--duration", "1", "--fault-probability", "2"],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("fault_probability"), "stderr was: {}", stderr);
}
