//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::error::ProcessorError;
use crate::domain::geometry::{AnchorPosition, Plane};
use crate::domain::types::{AnchorId, Side};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// The master anchor's clock is the reference timeline
    MasterSlave,
}

/// Transition order that counts as a valid crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingDirection {
    ExteriorToInterior,
    InteriorToExterior,
}

impl CrossingDirection {
    /// Side the tag starts on for a valid crossing
    pub fn from_side(&self) -> Side {
        match self {
            CrossingDirection::ExteriorToInterior => Side::Exterior,
            CrossingDirection::InteriorToExterior => Side::Interior,
        }
    }

    /// Side the tag ends on for a valid crossing
    pub fn to_side(&self) -> Side {
        self.from_side().opposite()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_pylon_id")]
    pub pylon_id: u32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { pylon_id: default_pylon_id() }
    }
}

fn default_pylon_id() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    pub dead_zone_m: f64,
    pub min_consecutive_blinks: u32,
    pub decision_window_ms: u64,
    /// Minimum decision confidence for VALID
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Minimum per-blink confidence to count as qualifying evidence
    #[serde(default = "default_min_blink_confidence")]
    pub min_blink_confidence: f64,
    #[serde(default = "default_expected_direction")]
    pub expected_direction: CrossingDirection,
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_min_blink_confidence() -> f64 {
    0.3
}

fn default_expected_direction() -> CrossingDirection {
    CrossingDirection::ExteriorToInterior
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub master_anchor_id: u8,
    pub sync_interval_ms: u64,
    /// Number of most recent sample pairs used for regression
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
}

fn default_sample_window() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    #[serde(default = "default_min_anchors")]
    pub min_anchors: usize,
    /// Max spread of one transmission's arrival times across anchors (µs)
    #[serde(default = "default_correlation_window_us")]
    pub correlation_window_us: u64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            min_anchors: default_min_anchors(),
            correlation_window_us: default_correlation_window_us(),
        }
    }
}

fn default_min_anchors() -> usize {
    4
}

fn default_correlation_window_us() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_blink_capacity")]
    pub blink_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            blink_capacity: default_blink_capacity(),
            event_capacity: default_event_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

fn default_blink_capacity() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    100
}

fn default_push_timeout_ms() -> u64 {
    50
}

fn default_status_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rs485Config {
    #[serde(default = "default_rs485_ports")]
    pub ports: Vec<String>,
    #[serde(default = "default_rs485_baud")]
    pub baud: u32,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self { ports: default_rs485_ports(), baud: default_rs485_baud() }
    }
}

fn default_rs485_ports() -> Vec<String> {
    vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()]
}

fn default_rs485_baud() -> u32 {
    115200
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: default_prometheus_port() }
    }
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct PylonConfig {
    pub point: [f64; 3],
    pub normal: [f64; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorConfig {
    pub id: u8,
    pub position: [f64; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub detection: DetectionConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub rs485: Rs485Config,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub pylon: Option<PylonConfig>,
    #[serde(default)]
    pub anchors: Vec<AnchorConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    pylon_id: u32,
    dead_zone_m: f64,
    min_consecutive_blinks: u32,
    decision_window_ms: u64,
    confidence_threshold: f64,
    min_blink_confidence: f64,
    expected_direction: CrossingDirection,
    sync_mode: SyncMode,
    master_anchor_id: AnchorId,
    sync_interval_ms: u64,
    sync_sample_window: usize,
    min_anchors: usize,
    correlation_window_us: u64,
    blink_capacity: usize,
    event_capacity: usize,
    push_timeout_ms: u64,
    status_interval_ms: u64,
    rs485_ports: Vec<String>,
    rs485_baud: u32,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    pylon: Option<PylonConfig>,
    anchors: Vec<AnchorPosition>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pylon_id: 1,
            dead_zone_m: 1.0,
            min_consecutive_blinks: 3,
            decision_window_ms: 500,
            confidence_threshold: default_confidence_threshold(),
            min_blink_confidence: default_min_blink_confidence(),
            expected_direction: default_expected_direction(),
            sync_mode: SyncMode::MasterSlave,
            master_anchor_id: AnchorId(17),
            sync_interval_ms: 500,
            sync_sample_window: default_sample_window(),
            min_anchors: default_min_anchors(),
            correlation_window_us: default_correlation_window_us(),
            blink_capacity: default_blink_capacity(),
            event_capacity: default_event_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
            rs485_ports: default_rs485_ports(),
            rs485_baud: default_rs485_baud(),
            metrics_interval_secs: 10,
            prometheus_port: default_prometheus_port(),
            pylon: None,
            anchors: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let anchors = toml_config
            .anchors
            .iter()
            .map(|a| AnchorPosition::new(AnchorId(a.id), a.position))
            .collect();

        Ok(Self {
            pylon_id: toml_config.site.pylon_id,
            dead_zone_m: toml_config.detection.dead_zone_m,
            min_consecutive_blinks: toml_config.detection.min_consecutive_blinks,
            decision_window_ms: toml_config.detection.decision_window_ms,
            confidence_threshold: toml_config.detection.confidence_threshold,
            min_blink_confidence: toml_config.detection.min_blink_confidence,
            expected_direction: toml_config.detection.expected_direction,
            sync_mode: toml_config.sync.mode,
            master_anchor_id: AnchorId(toml_config.sync.master_anchor_id),
            sync_interval_ms: toml_config.sync.sync_interval_ms,
            sync_sample_window: toml_config.sync.sample_window,
            min_anchors: toml_config.geometry.min_anchors,
            correlation_window_us: toml_config.geometry.correlation_window_us,
            blink_capacity: toml_config.queues.blink_capacity,
            event_capacity: toml_config.queues.event_capacity,
            push_timeout_ms: toml_config.queues.push_timeout_ms,
            status_interval_ms: toml_config.queues.status_interval_ms,
            rs485_ports: toml_config.rs485.ports,
            rs485_baud: toml_config.rs485.baud,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            pylon: toml_config.pylon,
            anchors,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from a path, falling back to defaults
    ///
    /// Defaults carry no pylon or anchors, so `validate()` still rejects them.
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Reject configurations the processor cannot start with
    pub fn validate(&self) -> Result<(), ProcessorError> {
        self.plane()?;

        if !(self.dead_zone_m.is_finite() && self.dead_zone_m >= 0.0) {
            return Err(ProcessorError::InvalidConfig(format!(
                "dead_zone_m must be >= 0, got {}",
                self.dead_zone_m
            )));
        }
        if self.min_consecutive_blinks < 1 {
            return Err(ProcessorError::InvalidConfig("min_consecutive_blinks must be >= 1".into()));
        }
        if self.decision_window_ms == 0 {
            return Err(ProcessorError::InvalidConfig("decision_window_ms must be > 0".into()));
        }
        if self.sync_interval_ms == 0 {
            return Err(ProcessorError::InvalidConfig("sync.sync_interval_ms must be > 0".into()));
        }
        if self.sync_sample_window < 2 {
            return Err(ProcessorError::InvalidConfig("sync.sample_window must be >= 2".into()));
        }
        if self.blink_capacity == 0 || self.event_capacity == 0 {
            return Err(ProcessorError::InvalidConfig("queue capacities must be > 0".into()));
        }

        let mut ids: Vec<u8> = self.anchors.iter().map(|a| a.anchor_id.0).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ProcessorError::InvalidConfig("duplicate anchor id".into()));
        }
        if !self.anchors.iter().any(|a| a.anchor_id == self.master_anchor_id) {
            return Err(ProcessorError::InvalidConfig(format!(
                "master anchor {} has no position",
                self.master_anchor_id
            )));
        }
        if self.anchors.len() < self.min_anchors {
            return Err(ProcessorError::InvalidConfig(format!(
                "{} anchors configured, geometry needs {}",
                self.anchors.len(),
                self.min_anchors
            )));
        }
        Ok(())
    }

    /// Build the pylon plane, normalizing its normal
    pub fn plane(&self) -> Result<Plane, ProcessorError> {
        let pylon = self
            .pylon
            .as_ref()
            .ok_or_else(|| ProcessorError::InvalidPlaneConfig("missing [pylon] section".into()))?;
        Plane::new(pylon.point, pylon.normal)
    }

    pub fn pylon_id(&self) -> u32 {
        self.pylon_id
    }

    pub fn dead_zone_m(&self) -> f64 {
        self.dead_zone_m
    }

    pub fn min_consecutive_blinks(&self) -> u32 {
        self.min_consecutive_blinks
    }

    pub fn decision_window_ms(&self) -> u64 {
        self.decision_window_ms
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    pub fn min_blink_confidence(&self) -> f64 {
        self.min_blink_confidence
    }

    pub fn expected_direction(&self) -> CrossingDirection {
        self.expected_direction
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn master_anchor_id(&self) -> AnchorId {
        self.master_anchor_id
    }

    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_ms
    }

    pub fn sync_sample_window(&self) -> usize {
        self.sync_sample_window
    }

    pub fn min_anchors(&self) -> usize {
        self.min_anchors
    }

    pub fn correlation_window_us(&self) -> u64 {
        self.correlation_window_us
    }

    pub fn blink_capacity(&self) -> usize {
        self.blink_capacity
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    pub fn push_timeout_ms(&self) -> u64 {
        self.push_timeout_ms
    }

    pub fn status_interval_ms(&self) -> u64 {
        self.status_interval_ms
    }

    pub fn rs485_ports(&self) -> &[String] {
        &self.rs485_ports
    }

    pub fn rs485_baud(&self) -> u32 {
        self.rs485_baud
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn anchors(&self) -> &[AnchorPosition] {
        &self.anchors
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests and simulation to set the geometry
    pub fn with_geometry(mut self, point: [f64; 3], normal: [f64; 3], anchors: &[(u8, [f64; 3])]) -> Self {
        self.pylon = Some(PylonConfig { point, normal });
        self.anchors = anchors.iter().map(|(id, pos)| AnchorPosition::new(AnchorId(*id), *pos)).collect();
        self
    }

    /// Builder method for tests to set detection parameters
    pub fn with_detection(mut self, dead_zone_m: f64, min_consecutive_blinks: u32, decision_window_ms: u64) -> Self {
        self.dead_zone_m = dead_zone_m;
        self.min_consecutive_blinks = min_consecutive_blinks;
        self.decision_window_ms = decision_window_ms;
        self
    }

    /// Builder method for tests to set the master anchor
    pub fn with_master_anchor(mut self, id: u8) -> Self {
        self.master_anchor_id = AnchorId(id);
        self
    }

    /// Builder method for tests to set the outbound queue capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
