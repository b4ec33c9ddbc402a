//! Unit conversion between transport values and engineering units
//!
//! Linear only:
//! - uplink: `engineering = raw * scale + offset`
//! - downlink: `raw = (engineering - offset) / scale`
//!
//! Control factors are stored as raw units per engineering unit, so the
//! downlink to an actuator is a single multiplication ([`to_actuator`]).
//! Plain IEEE-754 arithmetic, no rounding.

use crate::error::{BridgeError, Result};

/// Raw transport value to engineering units
#[inline]
pub fn to_engineering(raw: f64, scale: f64, offset: f64) -> f64 {
    raw * scale + offset
}

/// Engineering units back to a raw transport value
pub fn to_raw(engineering: f64, scale: f64, offset: f64) -> Result<f64> {
    if scale == 0.0 {
        return Err(BridgeError::DivisionByZero(format!(
            "reverse conversion of {} with scale 0",
            engineering
        )));
    }
    Ok((engineering - offset) / scale)
}

/// Engineering units to actuator units, `raw_per_unit` being e.g. `1000` for kW to W
#[inline]
pub fn to_actuator(engineering: f64, raw_per_unit: f64) -> f64 {
    engineering * raw_per_unit
}

/// Bind-time check of a configured scale factor.
///
/// Zero is rejected because the reverse direction would divide by it.
pub fn validate_scale(context: &str, scale: f64) -> Result<()> {
    if scale == 0.0 {
        return Err(BridgeError::DivisionByZero(format!(
            "{}: scale must not be 0",
            context
        )));
    }
    if !scale.is_finite() {
        return Err(BridgeError::config(format!(
            "{}: scale must be finite, got {}",
            context, scale
        )));
    }
    Ok(())
}

/// ASCII decimal payload for a value.
///
/// Integral values print without a fractional part (`375000`, not `375000.0`).
pub fn format_decimal(value: f64) -> String {
    format!("{}", value)
}
