//! # Streaming Engine Configuration
//!
//! Static tuning for the scan controller, the PLC link, the layer handshake and
//! synthetic test runs. Every section and field is optional; missing values take
//! the defaults below.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [scanner]
//! list_capacity = 8000
//! safety_margin = 100
//! bits_per_mm = 1000.0
//! max_laser_power_w = 400.0
//! completion_timeout_ms = 60000
//!
//! [controller]
//! ready_timeout_ms = 5000
//!
//! [handshake]
//! prepared_timeout_ms = 120000
//! dosing_factor = 2.0
//! ```
//!
//! The power-to-analog calibration (`max_laser_power_w`, `analog_full_scale`) is a
//! linear scale specific to the installed laser source.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

/// Scan controller tuning. Fixed for the lifetime of a device session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    #[serde(default = "default_list_capacity")]
    pub list_capacity: usize,
    /// Commands kept free at the end of the list before a batch is flushed.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,
    #[serde(default = "default_mark_speed")]
    pub default_mark_speed: f64,
    #[serde(default = "default_jump_speed")]
    pub default_jump_speed: f64,
    #[serde(default = "default_bits_per_mm")]
    pub bits_per_mm: f64,
    /// Largest magnitude of a device coordinate, bits.
    #[serde(default = "default_field_limit")]
    pub field_limit: i32,
    #[serde(default = "default_analog_channel")]
    pub analog_channel: u8,
    #[serde(default = "default_analog_full_scale")]
    pub analog_full_scale: u16,
    /// Laser power that maps to `analog_full_scale`, W.
    #[serde(default = "default_max_laser_power_w")]
    pub max_laser_power_w: f64,
    #[serde(default = "default_laser_on_delay_us")]
    pub laser_on_delay_us: u32,
    #[serde(default = "default_laser_off_delay_us")]
    pub laser_off_delay_us: u32,
    #[serde(default = "default_jump_delay_us")]
    pub jump_delay_us: u32,
    #[serde(default = "default_mark_delay_us")]
    pub mark_delay_us: u32,
    #[serde(default = "default_polygon_delay_us")]
    pub polygon_delay_us: u32,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            list_capacity: default_list_capacity(),
            safety_margin: default_safety_margin(),
            default_mark_speed: default_mark_speed(),
            default_jump_speed: default_jump_speed(),
            bits_per_mm: default_bits_per_mm(),
            field_limit: default_field_limit(),
            analog_channel: default_analog_channel(),
            analog_full_scale: default_analog_full_scale(),
            max_laser_power_w: default_max_laser_power_w(),
            laser_on_delay_us: default_laser_on_delay_us(),
            laser_off_delay_us: default_laser_off_delay_us(),
            jump_delay_us: default_jump_delay_us(),
            mark_delay_us: default_mark_delay_us(),
            polygon_delay_us: default_polygon_delay_us(),
            completion_timeout_ms: default_completion_timeout_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
        }
    }
}

impl ScannerConfig {
    /// Occupancy at which the open batch must be closed and executed.
    pub fn flush_threshold(&self) -> usize {
        self.list_capacity.saturating_sub(self.safety_margin)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Linear W -> analog output conversion, clamped to the output range.
    pub fn power_to_analog(&self, power_w: f64) -> u16 {
        if !power_w.is_finite() || power_w <= 0.0 {
            return 0;
        }
        let full_scale = f64::from(self.analog_full_scale);
        let value = (power_w / self.max_laser_power_w * full_scale).round();
        value.min(full_scale) as u16
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.list_capacity == 0 || self.safety_margin >= self.list_capacity {
            return Err(ConfigError::Invalid(format!(
                "scanner.safety_margin ({}) must be smaller than scanner.list_capacity ({})",
                self.safety_margin, self.list_capacity
            )));
        }
        if !(self.bits_per_mm.is_finite() && self.bits_per_mm > 0.0) {
            return Err(ConfigError::Invalid("scanner.bits_per_mm must be > 0".to_string()));
        }
        if self.field_limit <= 0 {
            return Err(ConfigError::Invalid("scanner.field_limit must be > 0".to_string()));
        }
        if self.default_mark_speed <= 0.0 || self.default_jump_speed <= 0.0 {
            return Err(ConfigError::Invalid("scanner default speeds must be > 0".to_string()));
        }
        if self.analog_full_scale == 0 || !(self.max_laser_power_w > 0.0) {
            return Err(ConfigError::Invalid(
                "scanner.analog_full_scale and scanner.max_laser_power_w must be > 0".to_string(),
            ));
        }
        if self.completion_timeout_ms == 0 || self.status_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scanner timeouts and poll interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// PLC link settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Bounded wait for the link to report ready at run start.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }
}

/// Per-layer handshake settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeConfig {
    /// Ceiling on the wait for `LaySurfacePrepared`.
    #[serde(default = "default_prepared_timeout_ms")]
    pub prepared_timeout_ms: u64,
    /// How often the prepared tag is read while waiting.
    #[serde(default = "default_handshake_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Powder source travel per layer, as a multiple of the layer thickness.
    #[serde(default = "default_dosing_factor")]
    pub dosing_factor: f64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            prepared_timeout_ms: default_prepared_timeout_ms(),
            poll_interval_ms: default_handshake_poll_interval_ms(),
            dosing_factor: default_dosing_factor(),
        }
    }
}

impl HandshakeConfig {
    pub fn prepared_timeout(&self) -> Duration {
        Duration::from_millis(self.prepared_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Geometry and speeds for synthetic test runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_part_size_mm")]
    pub part_size_mm: f64,
    #[serde(default = "default_hatch_spacing_mm")]
    pub hatch_spacing_mm: f64,
    #[serde(default = "default_mark_speed")]
    pub mark_speed: f64,
    #[serde(default = "default_jump_speed")]
    pub jump_speed: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            part_size_mm: default_part_size_mm(),
            hatch_spacing_mm: default_hatch_spacing_mm(),
            mark_speed: default_mark_speed(),
            jump_speed: default_jump_speed(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scanner.validate()?;
        if self.handshake.prepared_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake.prepared_timeout_ms must be > 0".to_string()));
        }
        if !(self.handshake.dosing_factor.is_finite() && self.handshake.dosing_factor > 0.0) {
            return Err(ConfigError::Invalid("handshake.dosing_factor must be > 0".to_string()));
        }
        let synthetic = &self.synthetic;
        if !(synthetic.part_size_mm > 0.0 && synthetic.hatch_spacing_mm > 0.0) {
            return Err(ConfigError::Invalid(
                "synthetic.part_size_mm and synthetic.hatch_spacing_mm must be > 0".to_string(),
            ));
        }
        if synthetic.hatch_spacing_mm > synthetic.part_size_mm {
            return Err(ConfigError::Invalid(
                "synthetic.hatch_spacing_mm must not exceed synthetic.part_size_mm".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_list_capacity() -> usize { 8000 }
fn default_safety_margin() -> usize { 100 }
fn default_mark_speed() -> f64 { 1000.0 }
fn default_jump_speed() -> f64 { 5000.0 }
fn default_bits_per_mm() -> f64 { 1000.0 }
fn default_field_limit() -> i32 { 524_287 }
fn default_analog_channel() -> u8 { 1 }
fn default_analog_full_scale() -> u16 { 4095 }
fn default_max_laser_power_w() -> f64 { 400.0 }
fn default_laser_on_delay_us() -> u32 { 100 }
fn default_laser_off_delay_us() -> u32 { 100 }
fn default_jump_delay_us() -> u32 { 250 }
fn default_mark_delay_us() -> u32 { 100 }
fn default_polygon_delay_us() -> u32 { 50 }
fn default_completion_timeout_ms() -> u64 { 60_000 }
fn default_status_poll_interval_ms() -> u64 { 1 }
fn default_ready_timeout_ms() -> u64 { 5_000 }
fn default_ready_poll_interval_ms() -> u64 { 50 }
fn default_prepared_timeout_ms() -> u64 { 120_000 }
fn default_handshake_poll_interval_ms() -> u64 { 10 }
fn default_dosing_factor() -> f64 { 2.0 }
fn default_part_size_mm() -> f64 { 10.0 }
fn default_hatch_spacing_mm() -> f64 { 0.5 }

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.scanner.list_capacity, 8000);
        assert_eq!(config.scanner.flush_threshold(), 7900);
        assert_eq!(config.scanner.field_limit, 524_287);
        assert_eq!(config.controller.ready_timeout_ms, 5_000);
        assert_eq!(config.handshake.prepared_timeout(), Duration::from_secs(120));
        assert_eq!(config.handshake.dosing_factor, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("machine.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[scanner]\nlist_capacity = 500\nsafety_margin = 20\n[handshake]\nprepared_timeout_ms = 3000").unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.scanner.list_capacity, 500);
        assert_eq!(config.scanner.flush_threshold(), 480);
        assert_eq!(config.handshake.prepared_timeout_ms, 3000);
        // Defaults for missing fields
        assert_eq!(config.scanner.bits_per_mm, 1000.0);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_load_config_rejects_margin_above_capacity() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("margin.toml");
        std::fs::write(&file_path, "[scanner]\nlist_capacity = 10\nsafety_margin = 10\n").unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_power_to_analog_scale() {
        let scanner = ScannerConfig::default();
        assert_eq!(scanner.power_to_analog(0.0), 0);
        assert_eq!(scanner.power_to_analog(-5.0), 0);
        assert_eq!(scanner.power_to_analog(200.0), 2048);
        assert_eq!(scanner.power_to_analog(400.0), 4095);
        assert_eq!(scanner.power_to_analog(1000.0), 4095);
    }
}
