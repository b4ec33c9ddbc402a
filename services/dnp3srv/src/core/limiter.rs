//! Plant safety limits
//!
//! Every setpoint that leaves the bridge passes through [`SafetyLimiter`]
//! regardless of what the master asked for:
//!
//! - absolute setpoints are clamped into `[0, max_active_power_kw]`
//! - ramp requests move the last accepted setpoint by one configured step
//!   and are then clamped the same way
//!
//! The limiter itself is stateless per call. The last accepted setpoint of
//! each control point lives in a [`RampTable`] owned by the session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::control::ControlKind;
use crate::error::{BridgeError, Result};

/// Static plant limits, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantLimits {
    pub max_active_power_kw: f64,
    /// Nameplate rating, informational only
    pub rated_nominal_power_kw: f64,
}

impl PlantLimits {
    /// `0 < max <= rated`, both finite
    pub fn new(max_active_power_kw: f64, rated_nominal_power_kw: f64) -> Result<Self> {
        let valid = max_active_power_kw.is_finite()
            && rated_nominal_power_kw.is_finite()
            && max_active_power_kw > 0.0
            && max_active_power_kw <= rated_nominal_power_kw;
        if !valid {
            return Err(BridgeError::InvalidLimits {
                max_kw: max_active_power_kw,
                rated_kw: rated_nominal_power_kw,
                ramp_step_kw: 0.0,
            });
        }
        Ok(Self {
            max_active_power_kw,
            rated_nominal_power_kw,
        })
    }
}

/// Clamp a requested power into `[0, max_active_power_kw]`.
///
/// NaN and infinities become 0.
pub fn clamp_absolute(requested_kw: f64, limits: &PlantLimits) -> f64 {
    if !requested_kw.is_finite() {
        return 0.0;
    }
    let clamped = requested_kw.max(0.0).min(limits.max_active_power_kw);
    // Normalise -0.0 so payloads never read "-0"
    if clamped == 0.0 {
        0.0
    } else {
        clamped
    }
}

/// Last accepted command for one control point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampState {
    pub point_index: u16,
    pub last_commanded_kw: f64,
    pub last_command_at: DateTime<Utc>,
}

/// Ramp baselines keyed by control point index.
///
/// Entries are created by the first accepted command and never removed.
#[derive(Debug, Clone, Default)]
pub struct RampTable {
    states: HashMap<u16, RampState>,
}

impl RampTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, point_index: u16) -> Option<&RampState> {
        self.states.get(&point_index)
    }

    pub fn record(&mut self, point_index: u16, accepted_kw: f64, now: DateTime<Utc>) {
        self.states.insert(
            point_index,
            RampState {
                point_index,
                last_commanded_kw: accepted_kw,
                last_command_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyLimiter {
    limits: PlantLimits,
    ramp_step_kw: f64,
}

impl SafetyLimiter {
    pub fn new(limits: PlantLimits, ramp_step_kw: f64) -> Result<Self> {
        if !(ramp_step_kw.is_finite() && ramp_step_kw > 0.0) {
            return Err(BridgeError::InvalidLimits {
                max_kw: limits.max_active_power_kw,
                rated_kw: limits.rated_nominal_power_kw,
                ramp_step_kw,
            });
        }
        Ok(Self {
            limits,
            ramp_step_kw,
        })
    }

    pub fn limits(&self) -> &PlantLimits {
        &self.limits
    }

    pub fn ramp_step_kw(&self) -> f64 {
        self.ramp_step_kw
    }

    pub fn clamp_absolute(&self, requested_kw: f64) -> f64 {
        clamp_absolute(requested_kw, &self.limits)
    }

    /// One step up or down from the previous accepted setpoint.
    ///
    /// Absolute setpoints are passed through `clamp_absolute` unchanged.
    pub fn apply_ramp(
        &self,
        kind: ControlKind,
        point_index: u16,
        previous: Option<&RampState>,
    ) -> Result<f64> {
        let baseline = previous
            .map(|state| state.last_commanded_kw)
            .ok_or(BridgeError::NoBaselineSetpoint(point_index))?;
        let target = match kind {
            ControlKind::RampUp => baseline + self.ramp_step_kw,
            ControlKind::RampDown => baseline - self.ramp_step_kw,
            ControlKind::SetpointAbsolute => baseline,
        };
        Ok(self.clamp_absolute(target))
    }

    /// Accepted engineering value for a control request
    pub fn evaluate(
        &self,
        kind: ControlKind,
        point_index: u16,
        requested_kw: f64,
        previous: Option<&RampState>,
    ) -> Result<f64> {
        match kind {
            ControlKind::SetpointAbsolute => Ok(self.clamp_absolute(requested_kw)),
            ControlKind::RampUp | ControlKind::RampDown => {
                self.apply_ramp(kind, point_index, previous)
            },
        }
    }
}
