//! Conversion between the desk's raw units and millimetres.
//!
//! Raw height is tenths of a millimetre above the desk's lowest position.
//! Raw speed is hundredths of a millimetre per second.

/// Height of the desk at its lowest position (mm)
pub const BASE_HEIGHT_MM: u16 = 620;

/// Height of the desk at its highest position (mm)
pub const MAX_HEIGHT_MM: u16 = 1270;

pub fn mm_to_raw(mm: f64) -> u16 {
    ((mm - f64::from(BASE_HEIGHT_MM)) * 10.0)
        .round()
        .clamp(0.0, f64::from(u16::MAX)) as u16
}

pub fn raw_to_mm(raw: u16) -> f64 {
    f64::from(raw) / 10.0 + f64::from(BASE_HEIGHT_MM)
}

pub fn raw_to_speed(raw: i16) -> f64 {
    f64::from(raw) / 100.0
}

/// Convert a tolerance in millimetres to raw units
pub fn tolerance_to_raw(mm: f64) -> u16 {
    (mm * 10.0).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Largest raw target the desk can physically reach
pub fn max_raw_height() -> u16 {
    mm_to_raw(f64::from(MAX_HEIGHT_MM))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_conversion() {
        assert_eq!(mm_to_raw(620.0), 0);
        assert_eq!(mm_to_raw(1040.0), 4200);
        assert_eq!(mm_to_raw(683.0), 630);
        assert_eq!(raw_to_mm(4200), 1040.0);
        assert_eq!(raw_to_mm(0), 620.0);
        assert_eq!(max_raw_height(), 6500);
    }

    #[test]
    fn test_conversions_are_inverse() {
        for mm in BASE_HEIGHT_MM..=MAX_HEIGHT_MM {
            assert_eq!(raw_to_mm(mm_to_raw(f64::from(mm))), f64::from(mm));
        }
        for raw in 0..=max_raw_height() {
            assert_eq!(mm_to_raw(raw_to_mm(raw)), raw);
        }
    }

    #[test]
    fn test_below_base_clamps_to_zero() {
        assert_eq!(mm_to_raw(600.0), 0);
    }

    #[test]
    fn test_speed_conversion() {
        assert_eq!(raw_to_speed(-10), -0.1);
        assert_eq!(raw_to_speed(2500), 25.0);
        assert_eq!(raw_to_speed(0), 0.0);
    }

    #[test]
    fn test_tolerance_conversion() {
        assert_eq!(tolerance_to_raw(2.0), 20);
        assert_eq!(tolerance_to_raw(0.5), 5);
        assert_eq!(tolerance_to_raw(0.0), 0);
    }
}
