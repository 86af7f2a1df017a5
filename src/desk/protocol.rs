use uuid::Uuid;

use crate::error::DecodeError;

/// Linak DPG GATT characteristic UUIDs

// Height and speed telemetry (read + notify)
pub const HEIGHT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a);

// Characteristic for sending movement commands
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0002_338a_1024_8a49_009c0215f78a);

// Reference input, written alongside the stop command by the vendor app
pub const REFERENCE_INPUT_UUID: Uuid =
    Uuid::from_u128(0x99fa0031_338a_1024_8a49_009c0215f78a);

/// Size of a height notification: u16 height + i16 speed
pub const TELEMETRY_LEN: usize = 4;

/// Commands understood by the desk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskCommand {
    /// Run the motors upwards for about a second
    Up,
    /// Run the motors downwards for about a second
    Down,
    /// Stop all movement
    Stop,
    ReferenceInputStop,
    // Accepted by the desk, never sent
    #[allow(dead_code)]
    ReferenceInputUp,
    #[allow(dead_code)]
    ReferenceInputDown,
}

impl DeskCommand {
    pub fn code(&self) -> u16 {
        match self {
            Self::Up => 71,
            Self::Down => 70,
            Self::Stop => 255,
            Self::ReferenceInputStop => 32769,
            Self::ReferenceInputUp => 32768,
            Self::ReferenceInputDown => 32767,
        }
    }

    /// The characteristic this command is written to
    pub fn characteristic(&self) -> Uuid {
        match self {
            Self::Up | Self::Down | Self::Stop => COMMAND_CHARACTERISTIC_UUID,
            Self::ReferenceInputStop | Self::ReferenceInputUp | Self::ReferenceInputDown => {
                REFERENCE_INPUT_UUID
            }
        }
    }

    /// Convert command to bytes for BLE transmission (u16 little-endian)
    pub fn to_bytes(&self) -> [u8; 2] {
        self.code().to_le_bytes()
    }
}

/// One height notification (or one-shot read) from the desk, in raw units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub height: u16,
    pub speed: i16,
}

impl Telemetry {
    /// Decode a height characteristic payload.
    ///
    /// Layout is little-endian `[height: u16, speed: i16]`. Values are not
    /// range checked.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; TELEMETRY_LEN] = data
            .try_into()
            .map_err(|_| DecodeError::Length(data.len()))?;

        Ok(Self {
            height: u16::from_le_bytes([bytes[0], bytes[1]]),
            speed: i16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn height_mm(&self) -> f64 {
        super::units::raw_to_mm(self.height)
    }

    pub fn speed_mm_s(&self) -> f64 {
        super::units::raw_to_speed(self.speed)
    }
}
