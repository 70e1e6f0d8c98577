//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys take the defaults below.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Observation noise variance (m²)
    pub observation_noise_m2: f64,
    /// Process noise variance per second of elapsed time (m²/s)
    pub process_noise_m2_per_s: f64,
    /// Covariance assigned to the first fix (m²)
    pub initial_covariance_m2: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self { observation_noise_m2: 25.0, process_noise_m2_per_s: 4.0, initial_covariance_m2: 100.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub window: usize,
    /// Sample-to-sample change above which the rolling average is reported
    pub jump_threshold_kmh: f64,
    pub still_kmh: f64,
    pub fast_kmh: f64,
    /// How long a still-to-fast spike waits for confirmation
    pub spike_confirm_ms: u64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            window: 3,
            jump_threshold_kmh: 5.0,
            still_kmh: 1.0,
            fast_kmh: 5.0,
            spike_confirm_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub stationary_distance_m: f64,
    pub stationary_speed_kmh: f64,
    /// Minimum displacement ever considered a teleport
    pub teleport_floor_m: f64,
    /// Multiplier on the expected displacement
    pub teleport_factor: f64,
    pub sharp_zigzag_deg: f64,
    pub sharp_zigzag_max_m: f64,
    pub sharp_zigzag_min_kmh: f64,
    pub micro_zigzag_deg: f64,
    pub micro_zigzag_max_m: f64,
    pub micro_zigzag_min_kmh: f64,
    pub backward_deg: f64,
    pub backward_max_m: f64,
    pub rapid_zigzag_deg: f64,
    pub rapid_zigzag_max_ms: u64,
    pub rapid_zigzag_max_m: f64,
    pub unstable_deg: f64,
    pub unstable_max_ms: u64,
    pub unstable_min_kmh: f64,
    pub unstable_min_m: f64,
    pub incoherence_factor: f64,
    pub incoherence_min_reported_kmh: f64,
    pub max_accuracy_m: f64,
    /// Max bearing difference for a buffered trend to be confirmed
    pub confirm_bearing_deg: f64,
    pub buffer_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            stationary_distance_m: 3.0,
            stationary_speed_kmh: 1.0,
            teleport_floor_m: 50.0,
            teleport_factor: 3.0,
            sharp_zigzag_deg: 120.0,
            sharp_zigzag_max_m: 30.0,
            sharp_zigzag_min_kmh: 5.0,
            micro_zigzag_deg: 60.0,
            micro_zigzag_max_m: 10.0,
            micro_zigzag_min_kmh: 10.0,
            backward_deg: 160.0,
            backward_max_m: 30.0,
            rapid_zigzag_deg: 90.0,
            rapid_zigzag_max_ms: 1000,
            rapid_zigzag_max_m: 20.0,
            unstable_deg: 45.0,
            unstable_max_ms: 500,
            unstable_min_kmh: 30.0,
            unstable_min_m: 5.0,
            incoherence_factor: 3.0,
            incoherence_min_reported_kmh: 5.0,
            max_accuracy_m: 40.0,
            confirm_bearing_deg: 45.0,
            buffer_capacity: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub slow_floor_m: f64,
    pub fast_floor_m: f64,
    /// Speeds below this use the slow floor
    pub slow_below_kmh: f64,
    pub max_interval_ms: u64,
    pub max_speed_kmh: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            slow_floor_m: 8.0,
            fast_floor_m: 5.0,
            slow_below_kmh: 5.0,
            max_interval_ms: 5000,
            max_speed_kmh: 400.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Gaps at or above this are filled by interpolation
    pub short_gap_ms: u64,
    /// Gaps above this start an estimated stretch instead
    pub long_gap_ms: u64,
    pub max_interpolated: usize,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self { short_gap_ms: 3000, long_gap_ms: 30_000, max_interpolated: 10 }
    }
}

/// Simplification cadence: run every `every` points while the trace is shorter than `below`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ThrottleTier {
    pub below: usize,
    pub every: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimplifierConfig {
    pub tiers: Vec<ThrottleTier>,
    /// Cadence once the trace outgrows every tier
    pub every_beyond: usize,
    pub speed_window: usize,
    pub slow_below_kmh: f64,
    pub fast_above_kmh: f64,
    pub tolerance_slow_m: f64,
    pub tolerance_mid_m: f64,
    pub tolerance_fast_m: f64,
}

impl Default for SimplifierConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ThrottleTier { below: 200, every: 1 },
                ThrottleTier { below: 1000, every: 5 },
                ThrottleTier { below: 5000, every: 10 },
            ],
            every_beyond: 20,
            speed_window: 50,
            slow_below_kmh: 50.0,
            fast_above_kmh: 100.0,
            tolerance_slow_m: 1.0,
            tolerance_mid_m: 3.0,
            tolerance_fast_m: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory of the file-backed key-value store
    pub store_dir: String,
    /// Session artifacts removed by reset
    pub artifacts_dir: String,
    pub throttle_every: usize,
    /// Every point is persisted while the trace is shorter than this
    pub always_below: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store_dir: "data/store".to_string(),
            artifacts_dir: "data/artifacts".to_string(),
            throttle_every: 50,
            always_below: 10,
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub silence_threshold_secs: u64,
    pub restart_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { check_interval_secs: 10, silence_threshold_secs: 60, restart_timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub channel_capacity: usize,
    /// Background queue entries processed between yields
    pub drain_batch: usize,
    /// Upper bound on start/stop calls into the location source
    pub call_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { channel_capacity: 256, drain_batch: 50, call_timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// File path for finished trips (JSONL format)
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "trips.jsonl".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identifier stamped on egressed trips
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub device: DeviceConfig,
    pub smoother: SmootherConfig,
    pub speed: SpeedConfig,
    pub validator: ValidatorConfig,
    pub sampling: SamplingConfig,
    pub gaps: GapConfig,
    pub simplifier: SimplifierConfig,
    pub persistence: PersistenceConfig,
    pub watchdog: WatchdogConfig,
    pub source: SourceConfig,
    pub egress: EgressConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    device_id: String,
    smoother: SmootherConfig,
    speed: SpeedConfig,
    validator: ValidatorConfig,
    sampling: SamplingConfig,
    gaps: GapConfig,
    simplifier: SimplifierConfig,
    persistence: PersistenceConfig,
    watchdog: WatchdogConfig,
    source: SourceConfig,
    egress: EgressConfig,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "recorder".to_string(),
            smoother: SmootherConfig::default(),
            speed: SpeedConfig::default(),
            validator: ValidatorConfig::default(),
            sampling: SamplingConfig::default(),
            gaps: GapConfig::default(),
            simplifier: SimplifierConfig::default(),
            persistence: PersistenceConfig::default(),
            watchdog: WatchdogConfig::default(),
            source: SourceConfig::default(),
            egress: EgressConfig::default(),
            metrics_interval_secs: MetricsConfig::default().interval_secs,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
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

        // Check CONFIG_FILE environment variable
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

        let device_id = if toml_config.device.id.is_empty() {
            "recorder".to_string()
        } else {
            toml_config.device.id
        };

        Ok(Self {
            device_id,
            smoother: toml_config.smoother,
            speed: toml_config.speed,
            validator: toml_config.validator,
            sampling: toml_config.sampling,
            gaps: toml_config.gaps,
            simplifier: toml_config.simplifier,
            persistence: toml_config.persistence,
            watchdog: toml_config.watchdog,
            source: toml_config.source,
            egress: toml_config.egress,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        let config_path = Self::resolve_config_path(args);
        Self::load_from_path(&config_path)
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn smoother(&self) -> &SmootherConfig {
        &self.smoother
    }

    pub fn speed(&self) -> &SpeedConfig {
        &self.speed
    }

    pub fn validator(&self) -> &ValidatorConfig {
        &self.validator
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn gaps(&self) -> &GapConfig {
        &self.gaps
    }

    pub fn simplifier(&self) -> &SimplifierConfig {
        &self.simplifier
    }

    pub fn persistence(&self) -> &PersistenceConfig {
        &self.persistence
    }

    pub fn watchdog(&self) -> &WatchdogConfig {
        &self.watchdog
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn egress_file(&self) -> &str {
        &self.egress.file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override validator thresholds
    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    /// Builder method for tests to override smoothing noise
    pub fn with_smoother(mut self, smoother: SmootherConfig) -> Self {
        self.smoother = smoother;
        self
    }

    /// Builder method for tests to override persistence settings
    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Builder method for tests to override watchdog timings
    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Builder method for tests to override gap handling
    pub fn with_gaps(mut self, gaps: GapConfig) -> Self {
        self.gaps = gaps;
        self
    }

    /// Builder method for tests to redirect trip egress
    pub fn with_egress_file(mut self, file: impl Into<String>) -> Self {
        self.egress.file = file.into();
        self
    }
}
