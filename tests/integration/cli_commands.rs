//! Integration tests driving the binary end to end

use assert_cmd::Command;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// 2024-01-01T00:00:00Z
const JAN_1: i64 = 1_704_067_200_000;
const DAY: i64 = 86_400_000;

fn binary() -> Command {
    let mut cmd = Command::cargo_bin("market-data-loader").unwrap();
    cmd.env_remove("RUST_LOG").env_remove("LOG_FORMAT");
    cmd
}

/// Config with pacing and health-check delays turned off
fn fast_config(dir: &Path) -> PathBuf {
    let path = dir.join("loader.json");
    let json = r#"{
      "connection": { "health_check_delay_ms": 0, "max_connections": 2 },
      "pacing": { "historical_min_interval_ms": 0, "head_timestamp_min_interval_ms": 0 },
      "calendar": { "continuous_symbols": ["BTCUSD"] }
    }"#;
    std::fs::write(&path, json).unwrap();
    path
}

/// Daily BTCUSD bars for January 2024 in the replay source layout
fn write_source(dir: &Path) {
    let mut csv = String::from("timestamp,open,high,low,close,volume\n");
    for day in 0..31 {
        writeln!(csv, "{},100,101,99,100.5,10", JAN_1 + day * DAY).unwrap();
    }
    std::fs::write(dir.join("BTCUSD_1d.csv"), csv).unwrap();
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_validate_config_reports_settings() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());

    let output = binary()
        .args(["validate", "config"])
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Valid configuration"));
    assert!(stdout.contains("Max connections: 2"));
    assert!(stdout.contains("embedded"));
}

#[test]
fn test_validate_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{ "retry": { "max_attempts": 0 } }"#).unwrap();

    binary()
        .args(["validate", "config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_validate_error_table() {
    let table = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/classifier/error_codes.json");

    let output = binary()
        .args(["validate", "error-table"])
        .arg(&table)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Valid error table"));
    assert!(stdout.contains("Mapped codes:"));
}

#[test]
fn test_gaps_on_empty_cache_plans_whole_range() {
    let dir = TempDir::new().unwrap();

    let output = binary()
        .args(["--output-format", "json", "--cache-dir"])
        .arg(dir.path())
        .args([
            "gaps",
            "--symbol",
            "BTCUSD",
            "--granularity",
            "1h",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-02",
        ])
        .assert()
        .success()
        .get_output()
        .clone();

    let json = stdout_json(&output);
    let missing = json["missing"].as_array().unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0]["start"], JAN_1);
    // A bare end date covers that whole day.
    assert_eq!(missing[0]["end"], JAN_1 + 2 * DAY);
    assert_eq!(json["segments"].as_array().unwrap().len(), 1);
}

#[test]
fn test_load_fills_cache_then_finds_nothing_missing() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source");
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&source).unwrap();
    write_source(&source);
    let config = fast_config(dir.path());

    let load = || {
        binary()
            .arg("--config")
            .arg(&config)
            .arg("--cache-dir")
            .arg(&cache)
            .args(["--output-format", "json"])
            .args([
                "load",
                "--symbol",
                "BTCUSD",
                "--granularity",
                "1d",
                "--mode",
                "full",
                "--start",
                "2024-01-01",
                "--end",
                "2024-01-31",
            ])
            .arg("--source-dir")
            .arg(&source)
            .assert()
            .success()
            .get_output()
            .clone()
    };

    let first = stdout_json(&load());
    assert_eq!(first["success"], true);
    assert_eq!(first["rows"], 31);
    assert_eq!(first["diagnostics"]["segments_fetched"], 1);
    assert!(cache.join("BTCUSD_1d.csv").exists());

    let second = stdout_json(&load());
    assert_eq!(second["success"], true);
    assert_eq!(second["diagnostics"]["segments_planned"], 0);
    assert_eq!(second["diagnostics"]["provider_calls_made"], 0);
    assert_eq!(second["rows"], 31);
}

#[test]
fn test_load_with_unknown_symbol_fails() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    write_source(&source);
    let config = fast_config(dir.path());

    let output = binary()
        .arg("--config")
        .arg(&config)
        .arg("--cache-dir")
        .arg(dir.path().join("cache"))
        .args(["--output-format", "json"])
        .args([
            "load",
            "--symbol",
            "NOPE",
            "--granularity",
            "1d",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-10",
        ])
        .arg("--source-dir")
        .arg(&source)
        .assert()
        .failure()
        .get_output()
        .clone();

    let json = stdout_json(&output);
    assert_eq!(json["success"], false);
}
