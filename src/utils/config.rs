use crate::algorithms::trilateration::{PairPolicy, TrilaterationEngine, DEFAULT_CONTINUITY_TOLERANCE_M};
use crate::core::{AnchorPosition, RadioTimestamp};
use crate::processing::segment::Segmenter;
use crate::utils::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Inclusive range of node ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub first: u16,
    pub last: u16,
}

impl IdRange {
    pub const fn new(first: u16, last: u16) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, id: u16) -> bool {
        (self.first..=self.last).contains(&id)
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Radio-side ranging parameters shared by tags and anchors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangingConfig {
    pub tag_ids: IdRange,
    pub anchor_ids: IdRange,
    /// Interval between discovery blinks (milliseconds)
    pub blink_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Pause before retrying a discovery that found no anchor
    pub discovery_backoff_ms: u64,
    pub ranging_init_timeout_ms: u64,
    pub poll_ack_timeout_ms: u64,
    /// Anchor-side wait for Range after answering a Poll
    pub range_timeout_ms: u64,
    pub range_report_timeout_ms: u64,
    /// Delay between a frame's reception and the scheduled reply (microseconds)
    pub reply_delay_us: u64,
    /// Extra Poll attempts per anchor before it is marked stale
    pub max_poll_retries: u8,
    pub reset_timeout_ms: u64,
    pub hard_reset_timeout_ms: u64,
    /// Sleep after a completed round
    pub round_sleep_ms: u64,
    pub min_anchors: u8,
    pub max_anchors: u8,
    pub max_plausible_distance_m: f64,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            tag_ids: IdRange::new(1, 99),
            anchor_ids: IdRange::new(100, 199),
            blink_interval_ms: 80,
            discovery_timeout_ms: 100,
            discovery_backoff_ms: 100,
            ranging_init_timeout_ms: 10,
            poll_ack_timeout_ms: 10,
            range_timeout_ms: 10,
            range_report_timeout_ms: 10,
            reply_delay_us: 3_000,
            max_poll_retries: 1,
            reset_timeout_ms: 500,
            hard_reset_timeout_ms: 3_000,
            round_sleep_ms: 100,
            min_anchors: 2,
            max_anchors: 2,
            max_plausible_distance_m: 100.0,
        }
    }
}

impl RangingConfig {
    pub fn reply_delay(&self) -> RadioTimestamp {
        RadioTimestamp::from_micros(self.reply_delay_us)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_address: String,
    pub sample_log_path: PathBuf,
    /// Upper bound on one wait of the relay loop (milliseconds)
    pub poll_timeout_ms: u64,
    /// A granted tag silent for this long loses its turn and its connection
    pub response_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:30001".to_string(),
            sample_log_path: PathBuf::from("timestamp_ESP32.txt"),
            poll_timeout_ms: 100,
            response_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

/// System-wide configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub ranging: RangingConfig,
    pub relay: RelayConfig,
    pub segmenter: Segmenter,
    pub logging: LoggingConfig,
    /// Acceptance radius for history-based disambiguation (metres)
    pub continuity_tolerance_m: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            ranging: RangingConfig::default(),
            relay: RelayConfig::default(),
            segmenter: Segmenter::default(),
            logging: LoggingConfig::default(),
            continuity_tolerance_m: DEFAULT_CONTINUITY_TOLERANCE_M,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {parameter} = {value}: {reason}")]
    InvalidParameter { parameter: String, value: String, reason: String },
    #[error("missing {parameter}")]
    MissingParameter { parameter: String },
    #[error("{message}")]
    IoError { message: String },
    #[error("{message}")]
    SerializationError { message: String },
    #[error("anchor {anchor_id}: {reason}")]
    AnchorConflict { anchor_id: u16, reason: String },
    #[error("geometry: {reason}")]
    GeometryValidation { reason: String },
}

/// Configuration validation result
#[derive(Debug)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    fn into_result(self) -> Result<(), ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// On-disk layout of a configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFileData {
    #[serde(default)]
    system: SystemConfig,
    anchors: Vec<AnchorPosition>,
    #[serde(default = "PairPolicy::deployment_defaults")]
    pair_policies: Vec<PairPolicy>,
}

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Deployment configuration: system parameters, anchor table and layout policies
pub struct ConfigurationManager {
    system_config: SystemConfig,
    anchors: BTreeMap<u16, AnchorPosition>,
    pair_policies: Vec<PairPolicy>,
    config_file_path: Option<PathBuf>,
    is_modified: bool,
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self {
            system_config: SystemConfig::default(),
            anchors: BTreeMap::new(),
            pair_policies: PairPolicy::deployment_defaults(),
            config_file_path: None,
            is_modified: false,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.load_from_file(path)?;
        Ok(manager)
    }

    pub fn system_config(&self) -> &SystemConfig {
        &self.system_config
    }

    pub fn ranging(&self) -> &RangingConfig {
        &self.system_config.ranging
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.system_config.relay
    }

    pub fn segmenter(&self) -> Segmenter {
        self.system_config.segmenter
    }

    pub fn update_system_config(&mut self, config: SystemConfig) -> Result<(), ConfigError> {
        Self::validate_system_config(&config).into_result()?;
        self.system_config = config;
        self.is_modified = true;
        Ok(())
    }

    pub fn anchor(&self, anchor_id: u16) -> Option<&AnchorPosition> {
        self.anchors.get(&anchor_id)
    }

    pub fn anchors(&self) -> impl Iterator<Item = &AnchorPosition> {
        self.anchors.values()
    }

    /// Add or replace an anchor; the id must lie in the anchor range
    pub fn set_anchor(&mut self, anchor: AnchorPosition) -> Result<(), ConfigError> {
        if !self.system_config.ranging.anchor_ids.contains(anchor.id) {
            return Err(ConfigError::AnchorConflict {
                anchor_id: anchor.id,
                reason: "id outside the configured anchor range".to_string(),
            });
        }
        if !anchor.x.is_finite() || !anchor.y.is_finite() {
            return Err(ConfigError::GeometryValidation {
                reason: format!("anchor {} has non-finite coordinates", anchor.id),
            });
        }
        self.anchors.insert(anchor.id, anchor);
        self.is_modified = true;
        Ok(())
    }

    pub fn remove_anchor(&mut self, anchor_id: u16) -> Option<AnchorPosition> {
        self.is_modified = true;
        self.anchors.remove(&anchor_id)
    }

    pub fn pair_policies(&self) -> &[PairPolicy] {
        &self.pair_policies
    }

    pub fn set_pair_policies(&mut self, policies: Vec<PairPolicy>) {
        self.pair_policies = policies;
        self.is_modified = true;
    }

    pub fn set_continuity_tolerance(&mut self, tolerance_m: f64) -> Result<f64, ConfigError> {
        if !(tolerance_m > 0.0 && tolerance_m.is_finite()) {
            return Err(invalid("continuity_tolerance_m", tolerance_m, "must be positive"));
        }
        let old_value = self.system_config.continuity_tolerance_m;
        self.system_config.continuity_tolerance_m = tolerance_m;
        self.is_modified = true;
        Ok(old_value)
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    pub fn config_file_path(&self) -> Option<&Path> {
        self.config_file_path.as_deref()
    }

    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        let data: ConfigFileData = serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to parse config file '{}': {}", path.display(), e),
        })?;

        let mut seen = BTreeSet::new();
        for anchor in &data.anchors {
            if !seen.insert(anchor.id) {
                return Err(ConfigError::AnchorConflict {
                    anchor_id: anchor.id,
                    reason: "duplicate anchor id".to_string(),
                });
            }
        }

        let candidate = Self {
            system_config: data.system,
            anchors: data.anchors.into_iter().map(|anchor| (anchor.id, anchor)).collect(),
            pair_policies: data.pair_policies,
            config_file_path: Some(path.to_path_buf()),
            is_modified: false,
        };
        candidate.validate().into_result()?;

        *self = candidate;
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let data = ConfigFileData {
            system: self.system_config.clone(),
            anchors: self.anchors.values().copied().collect(),
            pair_policies: self.pair_policies.clone(),
        };

        let content = serde_json::to_string_pretty(&data).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path.display(), e),
        })?;

        self.config_file_path = Some(path.to_path_buf());
        self.is_modified = false;
        Ok(())
    }

    /// Validate system parameters in isolation
    pub fn validate_system_config(config: &SystemConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut suggestions = Vec::new();
        let ranging = &config.ranging;

        let timeouts = [
            ("blink_interval_ms", ranging.blink_interval_ms),
            ("discovery_timeout_ms", ranging.discovery_timeout_ms),
            ("ranging_init_timeout_ms", ranging.ranging_init_timeout_ms),
            ("poll_ack_timeout_ms", ranging.poll_ack_timeout_ms),
            ("range_timeout_ms", ranging.range_timeout_ms),
            ("range_report_timeout_ms", ranging.range_report_timeout_ms),
            ("reset_timeout_ms", ranging.reset_timeout_ms),
            ("hard_reset_timeout_ms", ranging.hard_reset_timeout_ms),
            ("relay.poll_timeout_ms", config.relay.poll_timeout_ms),
            ("relay.response_timeout_ms", config.relay.response_timeout_ms),
        ];
        for (parameter, value) in timeouts {
            if value == 0 {
                errors.push(invalid(parameter, value, "timeout must be non-zero"));
            }
        }

        if ranging.reply_delay_us == 0 {
            errors.push(invalid("reply_delay_us", 0, "reply delay must be positive"));
        } else if ranging.reply_delay_us >= ranging.poll_ack_timeout_ms * 1_000 {
            errors.push(invalid(
                "reply_delay_us",
                ranging.reply_delay_us,
                "replies would arrive after the poll-ack timeout",
            ));
        }

        if ranging.tag_ids.first == 0 || ranging.anchor_ids.first == 0 {
            errors.push(invalid("tag_ids/anchor_ids", 0, "id 0 is reserved for broadcast"));
        }
        if ranging.tag_ids.first > ranging.tag_ids.last || ranging.anchor_ids.first > ranging.anchor_ids.last {
            errors.push(invalid("tag_ids/anchor_ids", "empty", "id ranges must not be empty"));
        }
        if ranging.tag_ids.overlaps(&ranging.anchor_ids) {
            errors.push(invalid(
                "tag_ids/anchor_ids",
                format!("{:?} / {:?}", ranging.tag_ids, ranging.anchor_ids),
                "tag and anchor id ranges must be disjoint",
            ));
        }

        if ranging.min_anchors == 0 || ranging.min_anchors > ranging.max_anchors {
            errors.push(invalid(
                "min_anchors",
                ranging.min_anchors,
                "must be at least 1 and not above max_anchors",
            ));
        }
        if ranging.max_anchors > 2 {
            errors.push(invalid("max_anchors", ranging.max_anchors, "at most two anchors are ranged per round"));
        }

        if ranging.max_plausible_distance_m <= 0.0 {
            errors.push(invalid(
                "max_plausible_distance_m",
                ranging.max_plausible_distance_m,
                "must be positive",
            ));
        }

        if ranging.hard_reset_timeout_ms <= ranging.reset_timeout_ms {
            warnings.push("hard reset fires before any soft reset".to_string());
            suggestions.push("set hard_reset_timeout_ms well above reset_timeout_ms".to_string());
        }
        if ranging.max_poll_retries > 3 {
            warnings.push("many poll retries stretch a round well past the relay turn".to_string());
        }

        if !(config.continuity_tolerance_m > 0.0) {
            errors.push(invalid("continuity_tolerance_m", config.continuity_tolerance_m, "must be positive"));
        }
        if config.segmenter.window == 0 {
            errors.push(invalid("segmenter.window", 0, "window must hold at least one sample"));
        }
        if config.segmenter.threshold < 0.0 {
            errors.push(invalid("segmenter.threshold", config.segmenter.threshold, "must not be negative"));
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            suggestions,
        }
    }

    /// Validate the whole deployment: parameters, anchor table and policies
    pub fn validate(&self) -> ValidationResult {
        let mut result = Self::validate_system_config(&self.system_config);
        let anchor_ids = self.system_config.ranging.anchor_ids;

        let origins = self.anchors.values().filter(|anchor| anchor.is_origin).count();
        if origins != 1 {
            result.errors.push(ConfigError::GeometryValidation {
                reason: format!("exactly one origin anchor required, found {}", origins),
            });
        }

        for anchor in self.anchors.values() {
            if !anchor_ids.contains(anchor.id) {
                result.errors.push(ConfigError::AnchorConflict {
                    anchor_id: anchor.id,
                    reason: "id outside the configured anchor range".to_string(),
                });
            }
        }

        for policy in &self.pair_policies {
            let [a, b] = policy.anchors;
            if a == b {
                result.errors.push(ConfigError::AnchorConflict {
                    anchor_id: a,
                    reason: "pair policy names the same anchor twice".to_string(),
                });
            }
            for id in [a, b] {
                if !self.anchors.contains_key(&id) {
                    result
                        .warnings
                        .push(format!("pair policy references unconfigured anchor {}", id));
                }
            }
        }

        if self.anchors.len() < 2 {
            result
                .warnings
                .push("fewer than two anchors configured, no position can be computed".to_string());
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Trilateration engine for the configured anchor table
    pub fn build_engine(&self) -> Result<TrilaterationEngine, ConfigError> {
        self.validate().into_result()?;
        Ok(TrilaterationEngine::new(
            self.anchors.values().copied(),
            self.pair_policies.clone(),
            self.system_config.continuity_tolerance_m,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::trilateration::LayoutRule;

    fn deployment() -> ConfigurationManager {
        let mut manager = ConfigurationManager::new();
        manager.set_anchor(AnchorPosition::origin(101, 0.0, 0.0)).unwrap();
        manager.set_anchor(AnchorPosition::new(102, 2.5, 0.0)).unwrap();
        manager.set_anchor(AnchorPosition::new(103, 0.0, 4.0)).unwrap();
        manager.set_anchor(AnchorPosition::new(104, 2.5, 4.0)).unwrap();
        manager
    }

    #[test]
    fn test_default_system_config() {
        let config = SystemConfig::default();
        assert_eq!(config.ranging.reply_delay_us, 3_000);
        assert_eq!(config.ranging.max_poll_retries, 1);
        assert_eq!(config.relay.bind_address, "0.0.0.0:30001");
        assert!(ConfigurationManager::validate_system_config(&config).is_valid);
    }

    #[test]
    fn test_deployment_is_valid() {
        let manager = deployment();
        let result = manager.validate();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(manager.build_engine().is_ok());
    }

    #[test]
    fn test_requires_exactly_one_origin() {
        let mut manager = deployment();
        manager.set_anchor(AnchorPosition::origin(104, 2.5, 4.0)).unwrap();
        assert!(!manager.validate().is_valid);

        manager.remove_anchor(101);
        manager.remove_anchor(104);
        let result = manager.validate();
        assert!(result
            .errors
            .iter()
            .any(|error| matches!(error, ConfigError::GeometryValidation { .. })));
        assert!(manager.build_engine().is_err());
    }

    #[test]
    fn test_anchor_outside_range_rejected() {
        let mut manager = ConfigurationManager::new();
        assert!(matches!(
            manager.set_anchor(AnchorPosition::new(5, 0.0, 0.0)),
            Err(ConfigError::AnchorConflict { anchor_id: 5, .. })
        ));
    }

    #[test]
    fn test_overlapping_id_ranges_rejected() {
        let mut config = SystemConfig::default();
        config.ranging.tag_ids = IdRange::new(1, 120);
        let mut manager = ConfigurationManager::new();
        assert!(manager.update_system_config(config).is_err());
    }

    #[test]
    fn test_reply_delay_must_fit_timeout() {
        let mut config = SystemConfig::default();
        config.ranging.reply_delay_us = 0;
        assert!(!ConfigurationManager::validate_system_config(&config).is_valid);
        config.ranging.reply_delay_us = 12_000;
        assert!(!ConfigurationManager::validate_system_config(&config).is_valid);
    }

    #[test]
    fn test_policy_to_unknown_anchor_warns() {
        let mut manager = deployment();
        manager.set_pair_policies(vec![PairPolicy::new(101, 150, LayoutRule::PreferLargerY)]);
        let result = manager.validate();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployment.json");

        let mut manager = deployment();
        manager.set_continuity_tolerance(0.25).unwrap();
        manager.save_to_file(&path).unwrap();
        assert!(!manager.is_modified());

        let loaded = ConfigurationManager::from_file(&path).unwrap();
        assert_eq!(loaded.anchors().count(), 4);
        assert_eq!(loaded.anchor(101).map(|anchor| anchor.is_origin), Some(true));
        assert_eq!(loaded.system_config().continuity_tolerance_m, 0.25);
        assert_eq!(loaded.pair_policies(), PairPolicy::deployment_defaults().as_slice());
        assert_eq!(loaded.config_file_path(), Some(path.as_path()));
    }

    #[test]
    fn test_load_rejects_duplicate_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.json");
        fs::write(
            &path,
            r#"{"anchors": [
                {"id": 101, "x": 0.0, "y": 0.0, "is_origin": true},
                {"id": 101, "x": 1.0, "y": 0.0}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            ConfigurationManager::from_file(&path),
            Err(ConfigError::AnchorConflict { anchor_id: 101, .. })
        ));
    }

    #[test]
    fn test_load_minimal_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minimal.json");
        fs::write(
            &path,
            r#"{"anchors": [
                {"id": 101, "x": 0.0, "y": 0.0, "is_origin": true},
                {"id": 102, "x": 2.5, "y": 0.0}
            ]}"#,
        )
        .unwrap();
        let manager = ConfigurationManager::from_file(&path).unwrap();
        assert_eq!(manager.ranging().poll_ack_timeout_ms, 10);
        assert_eq!(manager.pair_policies().len(), 2);
    }
}
