//! Plant constraint mode indications
//!
//! Two binary inputs tell the master how the plant is currently commanded:
//!
//! - production constraint: the last accepted setpoint is below the
//!   generation limit
//! - power gradient constraint: the last accepted control was a ramp
//!
//! Both follow accepted controls only. Changes are mirrored to
//! `{base}/{name}/state` as `ON` / `OFF`.

use serde::{Deserialize, Serialize};

use super::config::MqttSettings;
use super::control::ControlKind;
use super::limiter::PlantLimits;
use super::points::{PointKey, PointKind};
use crate::error::{BridgeError, Result};

pub const PRODUCTION_CONSTRAINT: &str = "production_constraint_mode";
pub const POWER_GRADIENT_CONSTRAINT: &str = "power_gradient_constraint_mode";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSettings {
    pub enabled: bool,
    /// Binary input index of the production constraint mode
    pub production_constraint_index: u16,
    /// Binary input index of the power gradient constraint mode
    pub power_gradient_constraint_index: u16,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            production_constraint_index: 0,
            power_gradient_constraint_index: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModePoint {
    pub name: &'static str,
    pub key: PointKey,
    pub state_topic: String,
}

/// One mode after an accepted control
#[derive(Debug, Clone, PartialEq)]
pub struct ModeIndication {
    pub key: PointKey,
    pub state_topic: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintModes {
    pub production: ModePoint,
    pub gradient: ModePoint,
}

impl ConstraintModes {
    /// `None` when the indications are disabled
    pub fn from_settings(settings: &ModeSettings, mqtt: &MqttSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        if settings.production_constraint_index == settings.power_gradient_constraint_index {
            return Err(BridgeError::DuplicatePoint {
                kind: PointKind::BinaryInput,
                index: settings.production_constraint_index,
            });
        }

        let point = |name: &'static str, index: u16| ModePoint {
            name,
            key: PointKey::new(PointKind::BinaryInput, index),
            state_topic: mqtt.state_topic(name),
        };
        Ok(Some(Self {
            production: point(PRODUCTION_CONSTRAINT, settings.production_constraint_index),
            gradient: point(POWER_GRADIENT_CONSTRAINT, settings.power_gradient_constraint_index),
        }))
    }

    pub fn points(&self) -> [&ModePoint; 2] {
        [&self.production, &self.gradient]
    }

    pub fn keys(&self) -> [PointKey; 2] {
        [self.production.key, self.gradient.key]
    }

    pub fn evaluate(&self, kind: ControlKind, accepted_kw: f64, limits: &PlantLimits) -> [ModeIndication; 2] {
        let indication = |point: &ModePoint, active: bool| ModeIndication {
            key: point.key,
            state_topic: point.state_topic.clone(),
            active,
        };
        [
            indication(&self.production, accepted_kw < limits.max_active_power_kw),
            indication(&self.gradient, kind != ControlKind::SetpointAbsolute),
        ]
    }
}

/// MQTT payload for a mode state
pub fn payload(active: bool) -> &'static str {
    if active {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn modes() -> ConstraintModes {
        ConstraintModes::from_settings(&ModeSettings::default(), &MqttSettings::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_defaults_use_binary_inputs_zero_and_one() {
        let modes = modes();
        assert_eq!(
            modes.keys(),
            [
                PointKey::new(PointKind::BinaryInput, 0),
                PointKey::new(PointKind::BinaryInput, 1)
            ]
        );
        assert_eq!(
            modes.gradient.state_topic,
            "scada/power_gradient_constraint_mode/state"
        );
    }

    #[test]
    fn test_evaluate_follows_accepted_control() {
        let modes = modes();
        let limits = PlantLimits::new(375.0, 400.0).unwrap();

        let [production, gradient] = modes.evaluate(ControlKind::SetpointAbsolute, 375.0, &limits);
        assert!(!production.active);
        assert!(!gradient.active);

        let [production, gradient] = modes.evaluate(ControlKind::RampDown, 370.0, &limits);
        assert!(production.active);
        assert!(gradient.active);
    }

    #[test]
    fn test_shared_index_rejected() {
        let settings = ModeSettings {
            enabled: true,
            production_constraint_index: 3,
            power_gradient_constraint_index: 3,
        };
        assert!(matches!(
            ConstraintModes::from_settings(&settings, &MqttSettings::default()),
            Err(BridgeError::DuplicatePoint {
                kind: PointKind::BinaryInput,
                index: 3
            })
        ));
    }

    #[test]
    fn test_disabled_is_none() {
        let settings = ModeSettings {
            enabled: false,
            ..ModeSettings::default()
        };
        assert!(ConstraintModes::from_settings(&settings, &MqttSettings::default())
            .unwrap()
            .is_none());
        assert_eq!(payload(true), "ON");
    }
}
