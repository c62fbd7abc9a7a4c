//! Unit tests for the JSON configuration file

use market_data_loader::config::{ConfigError, LoaderConfig};
use market_data_loader::pacing::RequestCategory;
use market_data_loader::Granularity;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_empty_document_is_the_default() {
    let config = LoaderConfig::from_json("{}").unwrap();
    assert_eq!(config, LoaderConfig::default());

    let pool = config.pool_settings();
    assert_eq!(pool.max_connections, 3);
    assert_eq!(pool.base_identity, 1);
    assert_eq!(pool.max_identity_attempts, 10);
    assert_eq!(pool.connection.idle_timeout, Duration::from_secs(180));
    assert_eq!(config.request_timeout(), Duration::from_secs(120));

    let pacing = config.pacing_limits();
    assert_eq!(pacing.max_requests_per_window, 50);
    assert_eq!(pacing.window, Duration::from_secs(1));
    assert_eq!(
        pacing.min_intervals.get(&RequestCategory::Historical),
        Some(&Duration::from_secs(2))
    );
    assert!(!pacing.min_intervals.contains_key(&RequestCategory::HeadTimestamp));

    assert_eq!(config.retry_policy().unwrap().max_attempts(), 3);
}

#[test]
fn test_partial_sections_override_defaults() {
    let config = LoaderConfig::from_json(
        r#"{
          "connection": { "max_connections": 5, "endpoint": "10.0.0.2:4002" },
          "pacing": { "historical_min_interval_ms": 0 },
          "retry": { "max_attempts": 6, "schedule_secs": [1, 2] },
          "planner": {
            "duration_limits_secs": { "1h": 604800 },
            "min_gap_secs": { "1d": 86400 },
            "max_history_secs": { "1w": 31536000 }
          },
          "calendar": { "continuous_symbols": ["ETHUSD"] },
          "store": { "root": "/var/cache/bars" }
        }"#,
    )
    .unwrap();

    assert_eq!(config.connection.max_connections, 5);
    assert_eq!(config.connection.endpoint, "10.0.0.2:4002");
    assert_eq!(config.connection.base_identity, 1);
    assert!(config.pacing_limits().min_intervals.is_empty());
    assert_eq!(config.retry_policy().unwrap().max_attempts(), 6);

    let limits = config.duration_limits().unwrap();
    assert_eq!(limits.max_duration_ms(Granularity::OneHour), 7 * 86_400_000);
    assert_eq!(limits.max_duration_ms(Granularity::OneMinute), 86_400_000);

    let analyzer = config.gap_analyzer().unwrap();
    assert_eq!(analyzer.min_gap(Granularity::OneDay), Duration::from_secs(86_400));

    let history = config.max_history();
    assert_eq!(history[&Granularity::OneWeek], Duration::from_secs(31_536_000));
    assert_eq!(history.len(), Granularity::ALL.len());
    assert_eq!(config.store.root.to_str(), Some("/var/cache/bars"));
}

#[test]
fn test_invalid_values_are_rejected() {
    for json in [
        r#"{ "connection": { "max_connections": 0 } }"#,
        r#"{ "connection": { "endpoint": " " } }"#,
        r#"{ "pacing": { "window_ms": 0 } }"#,
        r#"{ "retry": { "schedule_secs": [] } }"#,
        r#"{ "planner": { "duration_limits_secs": { "5m": 0 } } }"#,
    ] {
        let result = LoaderConfig::from_json(json);
        assert!(matches!(result, Err(ConfigError::Invalid(_))), "{json}");
    }
}

#[test]
fn test_malformed_documents_are_parse_errors() {
    for json in [
        "not json",
        r#"{ "planner": { "duration_limits_secs": { "2h": 60 } } }"#,
        r#"{ "retry": { "max_attempts": "three" } }"#,
    ] {
        let result = LoaderConfig::from_json(json);
        assert!(matches!(result, Err(ConfigError::ParseError(_))), "{json}");
    }
}

#[test]
fn test_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("loader.json");

    let mut config = LoaderConfig::default();
    config.connection.max_connections = 4;
    config.calendar.continuous_symbols = vec!["BTCUSD".to_string()];
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    assert_eq!(LoaderConfig::from_file(&path).unwrap(), config);

    let missing = LoaderConfig::from_file(&dir.path().join("absent.json"));
    assert!(matches!(missing, Err(ConfigError::IoError { .. })));
}
