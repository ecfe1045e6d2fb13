//! Configuration file support for RBN VFD.
//!
//! Loads settings from `~/.config/rbn-vfd/config.toml` on Linux
//! (or platform-appropriate location on other OSes), and writes them back
//! on shutdown so the last-used port and filters survive a restart.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{FeedConfig, MIN_TIMEOUT, RBN_HOST, RBN_PORT};
use crate::display::{BAUD_RATE, DISPLAY_WIDTH, LineLayout};
use crate::scheduler::{DEFAULT_ROTATION_INTERVAL, SchedulerSettings, clamp_interval};
use crate::service::MIN_PURGE_INTERVAL;

/// Settings for the VFD and the rotation filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Serial port to open at startup, if any.
    pub serial_port: Option<String>,

    /// Serial baud rate.
    pub baud_rate: u32,

    /// Characters per display line.
    pub width: usize,

    /// Order of fields on each line.
    pub layout: LineLayout,

    /// Minimum SNR (dB) for a spot to be shown.
    pub min_snr: i32,

    /// Oldest spot to show, in minutes.
    pub max_age_minutes: u64,

    /// Rotation interval in milliseconds.
    pub scroll_interval_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: BAUD_RATE,
            width: DISPLAY_WIDTH,
            layout: LineLayout::default(),
            min_snr: 10,
            max_age_minutes: 10,
            scroll_interval_ms: DEFAULT_ROTATION_INTERVAL.as_millis() as u64,
        }
    }
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Callsign to use for RBN login.
    pub callsign: String,

    /// RBN server hostname.
    pub host: String,

    /// RBN server port.
    pub port: u16,

    /// Connection timeout in seconds.
    pub connect_timeout: u64,

    /// Read timeout in seconds.
    pub read_timeout: u64,

    /// How long aggregated spots are kept, in minutes.
    pub retention_minutes: u64,

    /// Seconds between eviction passes.
    pub purge_interval: u64,

    /// Enable Prometheus metrics HTTP endpoint.
    pub metrics_enabled: bool,

    /// Port for Prometheus metrics HTTP endpoint.
    pub metrics_port: u16,

    pub display: DisplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: String::new(),
            host: RBN_HOST.to_string(),
            port: RBN_PORT,
            connect_timeout: 30,
            read_timeout: 120,
            retention_minutes: 60,
            purge_interval: 5,
            metrics_enabled: false,
            metrics_port: 9090,
            display: DisplayConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file location.
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
            }
            _ => Ok(Config::default()),
        }
    }

    /// Write the configuration to the default location, creating the
    /// directory if needed.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path().context("No config directory on this platform")?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(path)
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rbn-vfd/config.toml"))
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.retention_minutes == 0 {
            bail!("retention_minutes must be at least 1");
        }
        if self.display.width == 0 {
            bail!("display.width must be at least 1");
        }
        if self.display.baud_rate == 0 {
            bail!("display.baud_rate must not be 0");
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes * 60)
    }

    /// Eviction cadence, never shorter than [`MIN_PURGE_INTERVAL`].
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval).max(MIN_PURGE_INTERVAL)
    }

    /// Feed settings, with both timeouts raised to [`MIN_TIMEOUT`].
    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_secs(self.connect_timeout).max(MIN_TIMEOUT),
            read_timeout: Duration::from_secs(self.read_timeout).max(MIN_TIMEOUT),
        }
    }

    /// Scheduler settings, with max age clamped to retention and the
    /// interval clamped to its floor.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let max_age =
            Duration::from_secs(self.display.max_age_minutes * 60).min(self.retention());
        SchedulerSettings {
            min_snr: self.display.min_snr,
            max_age,
            interval: clamp_interval(Duration::from_millis(self.display.scroll_interval_ms)),
            width: self.display.width,
            layout: self.display.layout,
            baud_rate: self.display.baud_rate,
        }
    }
}
