use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::capture::CaptureTarget;
use crate::error::{ConfigError, ValidationError};
use crate::matcher::ScaleRange;

/// Lowest accepted confidence threshold
pub const MIN_CONFIDENCE: f32 = 0.5;
/// Highest accepted confidence threshold
pub const MAX_CONFIDENCE: f32 = 1.0;
/// Threshold restored by "reset to defaults"
pub const DEFAULT_CONFIDENCE: f32 = 0.8;

/// Reject NaN and values outside [0.50, 1.00]
pub fn validate_confidence(value: f32) -> Result<f32, ValidationError> {
    if (MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::ConfidenceOutOfRange(value))
    }
}

/// Template scale search settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Search several template scales; `false` runs a single unscaled pass
    pub multi_scale: bool,
    pub min_scale: f32,
    pub max_scale: f32,
    pub samples: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let range = ScaleRange::default();
        Self {
            multi_scale: true,
            min_scale: range.min,
            max_scale: range.max,
            samples: range.samples,
        }
    }
}

impl ScanConfig {
    pub fn scale_range(&self) -> ScaleRange {
        if self.multi_scale {
            ScaleRange {
                min: self.min_scale,
                max: self.max_scale,
                samples: self.samples,
            }
        } else {
            ScaleRange::unscaled()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum correlation score for a match (0.50-1.00, strictly exceeded)
    pub confidence_threshold: f32,

    /// Template scale search
    pub scan: ScanConfig,

    /// Primary monitor only, or every monitor
    pub capture_target: CaptureTarget,

    /// Wait after a click before the next cycle
    pub click_delay_ms: u64,

    /// Wait between cycles without a click
    pub cycle_delay_ms: u64,

    /// Poll interval while paused
    pub pause_poll_ms: u64,

    /// Longest single wait before the worker re-checks its status
    pub tick_ms: u64,

    /// Auto-stop after this long without a qualifying detection
    pub inactivity_timeout_secs: u64,

    /// Repeated matches of one loot template inside this window count once
    pub loot_cooldown_ms: u64,

    /// Played when a run ends (operator stop or timeout)
    pub end_of_run_sound: Option<String>,

    /// Played on every counted loot detection
    pub loot_sound: Option<String>,

    /// Named template profiles, relative to the working directory
    pub profiles_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE,
            scan: ScanConfig::default(),
            capture_target: CaptureTarget::Primary,
            click_delay_ms: 500,
            cycle_delay_ms: 1000,
            pause_poll_ms: 500,
            tick_ms: 100,
            inactivity_timeout_secs: 300,
            loot_cooldown_ms: 4000,
            end_of_run_sound: None,
            loot_sound: None,
            profiles_file: "automation_templates.json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the application's config directory.
    /// Creates default config if file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            info!("Created default config at: {}", config_path.display());
            Ok(config)
        }
    }

    /// Load and validate a config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let load_err = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::LoadFailed {
            path: path.display().to_string(),
            source,
        };

        let content = fs::read_to_string(path).map_err(|e| load_err(Box::new(e)))?;
        let config: Config = serde_json::from_str(&content).map_err(|e| load_err(Box::new(e)))?;
        config.validate()?;

        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_err = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::SaveFailed {
            path: path.display().to_string(),
            source,
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| save_err(Box::new(e)))?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| save_err(Box::new(e)))?;
        fs::write(path, json).map_err(|e| save_err(Box::new(e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_confidence(self.confidence_threshold)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.scan
            .scale_range()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".to_string()));
        }
        if self.profiles_file.trim().is_empty() {
            return Err(ConfigError::Invalid("profiles_file must not be empty".to_string()));
        }
        Ok(())
    }

    /// Get the config file path (in app's base directory)
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let exe_path = env::current_exe().map_err(|_| ConfigError::NoConfigDir)?;
        let exe_dir = exe_path.parent().ok_or(ConfigError::NoConfigDir)?;

        Ok(exe_dir.join("config").join("config.json"))
    }

    /// Resolve a sound path; relative paths live next to the config file
    pub fn resolve_sound(&self, sound: &str) -> PathBuf {
        let path = Path::new(sound);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match Self::config_path() {
            Ok(config_path) => config_path
                .parent()
                .map(|dir| dir.join(path))
                .unwrap_or_else(|| path.to_path_buf()),
            Err(_) => path.to_path_buf(),
        }
    }

    pub fn click_delay(&self) -> Duration {
        Duration::from_millis(self.click_delay_ms)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn loot_cooldown(&self) -> Duration {
        Duration::from_millis(self.loot_cooldown_ms)
    }
}
