//! Integration tests for chunkdbd config: file, env overrides, CLI flags, and precedence.

use std::process::Command;

/// Run chunkdbd in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_chunkdbd(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_chunkdbd");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run chunkdbd");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

#[test]
fn validate_config_no_config_prints_defaults() {
    let (ok, stdout, stderr) = run_chunkdbd(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    for line in [
        "dataset=metrics",
        "chunk_duration_secs=7200",
        "metrics_delay_secs=900",
        "stale_data_delay_secs=21600",
        "lifecycle_interval_secs=60",
        "spill_dir=",
        "compression=none",
        "http_bind=127.0.0.1:8080",
    ] {
        assert!(stdout.lines().any(|l| l == line), "missing {:?} in: {}", line, stdout);
    }
}

#[test]
fn validate_config_cli_dataset_overrides_env() {
    let (ok, stdout, _) = run_chunkdbd(
        &["--validate-config", "--no-config", "--dataset", "cli_ds"],
        &[("CHUNKDB_DATASET", "env_ds")],
    );
    assert!(ok);
    assert!(stdout.contains("dataset=cli_ds"), "CLI should win: {}", stdout);
}

#[test]
fn validate_config_env_override_with_no_config() {
    let (ok, stdout, _) = run_chunkdbd(
        &["--validate-config", "--no-config"],
        &[
            ("CHUNKDB_DATASET", "env_ds"),
            ("CHUNKDB_METRICS_DELAY_SECS", "300"),
            ("CHUNKDB_COMPRESSION__TYPE", "lz4"),
        ],
    );
    assert!(ok);
    assert!(stdout.contains("dataset=env_ds"), "stdout: {}", stdout);
    assert!(stdout.contains("metrics_delay_secs=300"), "stdout: {}", stdout);
    assert!(stdout.contains("compression=lz4"), "stdout: {}", stdout);
}

#[test]
fn valid_config_file_merges_with_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("chunkdbd.toml");
    std::fs::write(
        &config_path,
        r#"
dataset = "prod"
stale_data_delay_secs = 43200
spill_dir = "/tmp/chunkdb_spill"

[compression]
type = "zstd"
level = 3
"#,
    )
    .expect("write config");
    let (ok, stdout, stderr) = run_chunkdbd(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("dataset=prod"));
    assert!(stdout.contains("stale_data_delay_secs=43200"));
    assert!(stdout.contains("metrics_delay_secs=900"));
    assert!(stdout.contains("spill_dir=/tmp/chunkdb_spill"));
    assert!(stdout.contains("compression=zstd:3"));
}

#[test]
fn invalid_compression_in_config_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("bad.toml");
    std::fs::write(
        &config_path,
        r#"
[compression]
type = "brotli"
"#,
    )
    .expect("write config");
    let (ok, _stdout, stderr) = run_chunkdbd(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
    );
    assert!(!ok, "unknown compression should fail");
    assert!(
        stderr.contains("unknown variant") || stderr.contains("brotli") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn stale_delay_shorter_than_metrics_delay_fails() {
    let (ok, _stdout, stderr) = run_chunkdbd(
        &["--validate-config", "--no-config"],
        &[
            ("CHUNKDB_METRICS_DELAY_SECS", "3600"),
            ("CHUNKDB_STALE_DATA_DELAY_SECS", "60"),
        ],
    );
    assert!(!ok);
    assert!(stderr.contains("stale data delay"), "stderr: {}", stderr);
}

#[test]
fn explicit_config_missing_file_fails() {
    let (ok, _stdout, stderr) = run_chunkdbd(
        &["--validate-config", "--config", "/nonexistent/chunkdbd.toml"],
        &[],
    );
    assert!(!ok, "missing config file with explicit --config should fail");
    assert!(
        stderr.contains("not found") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn validate_config_prints_ingest_file_from_cli() {
    let (ok, stdout, stderr) = run_chunkdbd(
        &[
            "--validate-config",
            "--no-config",
            "--ingest-file",
            "/tmp/metrics.txt",
            "--http-bind",
            "0.0.0.0:9090",
        ],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("ingest_file=/tmp/metrics.txt"));
    assert!(stdout.contains("http_bind=0.0.0.0:9090"));
}
