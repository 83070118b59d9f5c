//! Integration tests for configuration loading

use pylon_processor::domain::types::AnchorId;
use pylon_processor::domain::ProcessorError;
use pylon_processor::infra::{Config, CrossingDirection};
use std::io::Write;
use tempfile::NamedTempFile;

const PYLON_AND_ANCHORS: &str = r#"
[pylon]
point = [2.0, 0.0, 0.0]
normal = [0.0, 2.0, 0.0]

[[anchors]]
id = 1
position = [0.0, -10.0, 0.5]

[[anchors]]
id = 2
position = [0.0, 10.0, 0.5]

[[anchors]]
id = 3
position = [-15.0, 0.0, 6.0]

[[anchors]]
id = 4
position = [15.0, 0.0, 3.0]
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let content = format!(
        r#"
[site]
pylon_id = 4

[detection]
dead_zone_m = 0.75
min_consecutive_blinks = 2
decision_window_ms = 400
expected_direction = "interior_to_exterior"

[sync]
mode = "master_slave"
master_anchor_id = 1
sync_interval_ms = 250

[rs485]
ports = ["/dev/ttyAMA1"]
baud = 921600

[metrics]
interval_secs = 15
prometheus_port = 9091
{PYLON_AND_ANCHORS}"#
    );
    let temp_file = write_config(&content);

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.pylon_id(), 4);
    assert_eq!(config.dead_zone_m(), 0.75);
    assert_eq!(config.min_consecutive_blinks(), 2);
    assert_eq!(config.decision_window_ms(), 400);
    assert_eq!(config.expected_direction(), CrossingDirection::InteriorToExterior);
    assert_eq!(config.master_anchor_id(), AnchorId(1));
    assert_eq!(config.sync_interval_ms(), 250);
    assert_eq!(config.rs485_ports(), ["/dev/ttyAMA1".to_string()]);
    assert_eq!(config.rs485_baud(), 921600);
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.anchors().len(), 4);

    // Omitted sections and fields take their defaults
    assert_eq!(config.confidence_threshold(), 0.5);
    assert_eq!(config.sync_sample_window(), 8);
    assert_eq!(config.min_anchors(), 4);
    assert_eq!(config.blink_capacity(), 1000);

    config.validate().unwrap();
    let plane = config.plane().unwrap();
    assert!((plane.normal().y - 1.0).abs() < 1e-12);
}

#[test]
fn test_missing_pylon_fails_validation() {
    let temp_file = write_config(
        r#"
[detection]
dead_zone_m = 1.0
min_consecutive_blinks = 3
decision_window_ms = 500

[sync]
mode = "master_slave"
master_anchor_id = 1
sync_interval_ms = 500
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();
    assert!(matches!(config.validate(), Err(ProcessorError::InvalidPlaneConfig(_))));
}

#[test]
fn test_invalid_detection_values_rejected() {
    let content = format!(
        r#"
[detection]
dead_zone_m = -1.0
min_consecutive_blinks = 3
decision_window_ms = 500

[sync]
mode = "master_slave"
master_anchor_id = 1
sync_interval_ms = 500
{PYLON_AND_ANCHORS}"#
    );
    let temp_file = write_config(&content);
    let config = Config::from_file(temp_file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("dead_zone_m"));
}

#[test]
fn test_master_without_position_rejected() {
    let content = format!(
        r#"
[detection]
dead_zone_m = 1.0
min_consecutive_blinks = 3
decision_window_ms = 500

[sync]
mode = "master_slave"
master_anchor_id = 9
sync_interval_ms = 500
{PYLON_AND_ANCHORS}"#
    );
    let temp_file = write_config(&content);
    let config = Config::from_file(temp_file.path()).unwrap();
    assert!(matches!(config.validate(), Err(ProcessorError::InvalidConfig(_))));
}

#[test]
fn test_unknown_sync_mode_is_parse_error() {
    let temp_file = write_config(
        r#"
[detection]
dead_zone_m = 1.0
min_consecutive_blinks = 3
decision_window_ms = 500

[sync]
mode = "two_way_ranging"
master_anchor_id = 1
sync_interval_ms = 500
"#,
    );
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.dead_zone_m(), 1.0);
    assert_eq!(config.rs485_baud(), 115200);
    // Defaults carry no geometry, so the processor refuses to start on them
    assert!(config.validate().is_err());
}
