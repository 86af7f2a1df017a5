use anyhow::{Context, Result};
use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::desk::units::{mm_to_raw, tolerance_to_raw, BASE_HEIGHT_MM, MAX_HEIGHT_MM};
use crate::error::ConfigError;

/// Settings file contents. Every key is optional; missing keys keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bluetooth MAC address of the desk
    pub mac_address: Option<String>,

    /// Standing height (mm)
    pub stand_height: u16,

    /// Sitting height (mm)
    pub sit_height: u16,

    /// Distance from the target at which the desk is stopped (mm)
    pub height_tolerance: f64,

    /// Bluetooth adapter, ignored where there is a single default adapter
    pub adapter_name: String,

    /// Seconds
    pub scan_timeout: u64,
    pub connection_timeout: u64,
    pub movement_timeout: u64,

    /// Treat the desk stopping on its own as the end of a move
    pub detect_interference: bool,

    /// Remember the desk between runs to skip scanning
    pub cache_device: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mac_address: None,
            stand_height: BASE_HEIGHT_MM + 420,
            sit_height: BASE_HEIGHT_MM + 63,
            height_tolerance: 2.0,
            adapter_name: "hci0".to_string(),
            scan_timeout: 5,
            connection_timeout: 10,
            movement_timeout: 30,
            detect_interference: true,
            cache_device: true,
        }
    }
}

/// Control an Idasen standing desk over Bluetooth
#[derive(Parser, Debug)]
#[command(name = "idasen-desk", version)]
pub struct Cli {
    /// Mac address of the Idasen desk
    #[arg(long)]
    pub mac_address: Option<String>,

    /// The height the desk should be at when standing (mm)
    #[arg(long, value_name = "MM")]
    pub stand_height: Option<u16>,

    /// The height the desk should be at when sitting (mm)
    #[arg(long, value_name = "MM")]
    pub sit_height: Option<u16>,

    /// Distance between reported height and target height before ceasing move commands (mm)
    #[arg(long, value_name = "MM")]
    pub height_tolerance: Option<f64>,

    /// The bluetooth adapter device name
    #[arg(long = "adapter", value_name = "NAME")]
    pub adapter_name: Option<String>,

    /// The timeout for bluetooth scan (seconds)
    #[arg(long, value_name = "SECS")]
    pub scan_timeout: Option<u64>,

    /// The timeout for bluetooth connection (seconds)
    #[arg(long, value_name = "SECS")]
    pub connection_timeout: Option<u64>,

    /// The timeout for waiting for the desk to reach the specified height (seconds)
    #[arg(long, value_name = "SECS")]
    pub movement_timeout: Option<u64>,

    /// Read settings from this file instead of ~/.desk-control/config
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(flatten)]
    pub operation: OperationArgs,
}

#[derive(Args, Debug)]
#[group(required = false, multiple = false)]
pub struct OperationArgs {
    /// Move the desk to sitting height
    #[arg(long)]
    pub sit: bool,

    /// Move the desk to standing height
    #[arg(long)]
    pub stand: bool,

    /// Monitor desk height and speed
    #[arg(long)]
    pub monitor: bool,

    /// Move desk to specified height (mm)
    #[arg(long, value_name = "MM")]
    pub move_to: Option<u16>,

    /// Scan for devices using the configured adapter
    #[arg(long = "scan")]
    pub scan_adapter: bool,
}

impl OperationArgs {
    pub fn operation(&self) -> Operation {
        if self.sit {
            Operation::Sit
        } else if self.stand {
            Operation::Stand
        } else if self.monitor {
            Operation::Monitor
        } else if let Some(mm) = self.move_to {
            Operation::MoveTo(mm)
        } else if self.scan_adapter {
            Operation::ScanAdapter
        } else {
            Operation::Report
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Connect and print the current height
    Report,
    Sit,
    Stand,
    Monitor,
    /// Move to a height in mm
    MoveTo(u16),
    /// List every device the adapter can see
    ScanAdapter,
}

/// Validated settings for one run, heights in raw units
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub operation: Operation,
    pub mac_address: String,
    pub adapter_name: String,
    pub sit_raw: u16,
    pub stand_raw: u16,
    pub tolerance_raw: u16,
    pub scan_timeout: Duration,
    pub connection_timeout: Duration,
    pub movement_timeout: Duration,
    pub detect_interference: bool,
    pub cache_path: Option<PathBuf>,
}

impl Settings {
    /// Raw target height for moving operations
    pub fn target(&self) -> Option<u16> {
        match self.operation {
            Operation::Sit => Some(self.sit_raw),
            Operation::Stand => Some(self.stand_raw),
            Operation::MoveTo(mm) => Some(mm_to_raw(f64::from(mm))),
            Operation::Report | Operation::Monitor | Operation::ScanAdapter => None,
        }
    }

    /// Adapter name as shown to the user
    pub fn adapter_label(&self) -> &str {
        if cfg!(windows) {
            "default adapter"
        } else {
            &self.adapter_name
        }
    }
}

impl Config {
    /// Get the configuration directory path (~/.desk-control)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".desk-control"))
    }

    /// Get the configuration file path (~/.desk-control/config)
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config"))
    }

    /// Get the desk cache path (~/.desk-control/desk-cache.json)
    pub fn cache_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("desk-cache.json"))
    }

    /// Load overrides from a file. A missing file means no overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        log::debug!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    /// Apply command line overrides
    pub fn merge_cli(&mut self, cli: &Cli) {
        if let Some(mac_address) = &cli.mac_address {
            self.mac_address = Some(mac_address.clone());
        }
        if let Some(stand_height) = cli.stand_height {
            self.stand_height = stand_height;
        }
        if let Some(sit_height) = cli.sit_height {
            self.sit_height = sit_height;
        }
        if let Some(height_tolerance) = cli.height_tolerance {
            self.height_tolerance = height_tolerance;
        }
        if let Some(adapter_name) = &cli.adapter_name {
            self.adapter_name = adapter_name.clone();
        }
        if let Some(scan_timeout) = cli.scan_timeout {
            self.scan_timeout = scan_timeout;
        }
        if let Some(connection_timeout) = cli.connection_timeout {
            self.connection_timeout = connection_timeout;
        }
        if let Some(movement_timeout) = cli.movement_timeout {
            self.movement_timeout = movement_timeout;
        }
    }

    /// Layer defaults, the config file and the command line, then validate
    pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => Self::config_file().map_err(ConfigError::File)?,
        };
        let mut config = Self::from_file(&path).map_err(ConfigError::File)?;
        config.merge_cli(cli);

        let cache_path = if config.cache_device {
            match Self::cache_file() {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!("Desk cache disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut settings = config.validate(cli.operation.operation())?;
        settings.cache_path = cache_path;
        Ok(settings)
    }

    pub fn validate(self, operation: Operation) -> Result<Settings, ConfigError> {
        let mac_address = match self.mac_address {
            Some(mac) if !mac.trim().is_empty() => mac.trim().to_string(),
            // Listing devices needs no target
            _ if operation == Operation::ScanAdapter => String::new(),
            _ => return Err(ConfigError::MissingMacAddress),
        };

        if self.sit_height >= self.stand_height {
            return Err(ConfigError::SitNotBelowStand {
                sit: self.sit_height,
                stand: self.stand_height,
            });
        }
        if self.sit_height < BASE_HEIGHT_MM {
            return Err(ConfigError::SitBelowMinimum(self.sit_height));
        }
        if self.stand_height > MAX_HEIGHT_MM {
            return Err(ConfigError::StandAboveMaximum(self.stand_height));
        }
        if let Operation::MoveTo(mm) = operation {
            if !(BASE_HEIGHT_MM..=MAX_HEIGHT_MM).contains(&mm) {
                return Err(ConfigError::TargetOutOfRange(mm));
            }
        }
        if !self.height_tolerance.is_finite() || self.height_tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.height_tolerance));
        }

        Ok(Settings {
            operation,
            mac_address,
            adapter_name: self.adapter_name,
            sit_raw: mm_to_raw(f64::from(self.sit_height)),
            stand_raw: mm_to_raw(f64::from(self.stand_height)),
            tolerance_raw: tolerance_to_raw(self.height_tolerance),
            scan_timeout: Duration::from_secs(self.scan_timeout),
            connection_timeout: Duration::from_secs(self.connection_timeout),
            movement_timeout: Duration::from_secs(self.movement_timeout),
            detect_interference: self.detect_interference,
            cache_path: None,
        })
    }
}
