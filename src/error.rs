use thiserror::Error;
use uuid::Uuid;

use crate::desk::units::{BASE_HEIGHT_MM, MAX_HEIGHT_MM};

/// Invalid or missing settings, reported before any Bluetooth activity
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Mac address must be provided")]
    MissingMacAddress,
    #[error("Sit height ({sit}mm) must be less than stand height ({stand}mm)")]
    SitNotBelowStand { sit: u16, stand: u16 },
    #[error("Sit height ({0}mm) must be at least {min}mm", min = BASE_HEIGHT_MM)]
    SitBelowMinimum(u16),
    #[error("Stand height ({0}mm) must be at most {max}mm", max = MAX_HEIGHT_MM)]
    StandAboveMaximum(u16),
    #[error("Target height ({0}mm) must be between {min}mm and {max}mm", min = BASE_HEIGHT_MM, max = MAX_HEIGHT_MM)]
    TargetOutOfRange(u16),
    #[error("Height tolerance must be a non-negative number of mm, got {0}")]
    InvalidTolerance(f64),
    #[error("Reading config file failed: {0:#}")]
    File(anyhow::Error),
}

/// Malformed telemetry payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Telemetry payload must be 4 bytes, got {0}")]
    Length(usize),
}

#[derive(Error, Debug)]
pub enum DeskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No Bluetooth adapters found")]
    NoAdapter,
    #[error("Desk {0} not found")]
    NotFound(String),
    #[error("Failed to connect to desk: {0}")]
    Connection(String),
    #[error("Could not find characteristic {0} on desk")]
    MissingCharacteristic(Uuid),
    #[error("Characteristic {0} already has an active subscription")]
    AlreadySubscribed(Uuid),
    #[error("Malformed telemetry: {0}")]
    Decode(#[from] DecodeError),
    #[error("Lost connection with desk")]
    Disconnected,
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}
