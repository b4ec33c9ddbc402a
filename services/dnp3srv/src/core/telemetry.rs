//! MQTT telemetry to outstation point mapping

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::discovery::SensorDiscovery;
use super::points::{PointKey, PointKind, PointValue};
use super::unit;
use crate::error::{BridgeError, Result};

/// One subscribed topic and the point it feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBinding {
    pub topic: String,
    pub point_index: u16,
    #[serde(default = "default_point_kind")]
    pub point_kind: PointKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Home Assistant sensor to announce for this topic
    #[serde(default)]
    pub discovery: Option<SensorDiscovery>,
}

fn default_point_kind() -> PointKind {
    PointKind::AnalogInput
}

fn default_scale() -> f64 {
    1.0
}

impl TelemetryBinding {
    pub fn key(&self) -> PointKey {
        PointKey::new(self.point_kind, self.point_index)
    }
}

/// Value ready to be written into the point database
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointUpdate {
    pub point_index: u16,
    pub point_kind: PointKind,
    pub value: PointValue,
}

impl PointUpdate {
    pub fn key(&self) -> PointKey {
        PointKey::new(self.point_kind, self.point_index)
    }
}

/// Topic lookup table, in configuration order
#[derive(Debug, Clone, Default)]
pub struct TelemetryMap {
    bindings: Vec<TelemetryBinding>,
    by_topic: HashMap<String, usize>,
}

impl TelemetryMap {
    pub fn bind(bindings: &[TelemetryBinding]) -> Result<Self> {
        let mut by_topic = HashMap::with_capacity(bindings.len());
        let mut points = HashSet::with_capacity(bindings.len());

        for (position, binding) in bindings.iter().enumerate() {
            if binding.topic.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "telemetry binding for point {} has an empty topic",
                    binding.key()
                )));
            }
            if by_topic.insert(binding.topic.clone(), position).is_some() {
                return Err(BridgeError::DuplicateTopic(binding.topic.clone()));
            }
            if !points.insert(binding.key()) {
                return Err(BridgeError::DuplicatePoint {
                    kind: binding.point_kind,
                    index: binding.point_index,
                });
            }
            unit::validate_scale(&format!("telemetry {}", binding.topic), binding.scale)?;
            if !binding.offset.is_finite() {
                return Err(BridgeError::config(format!(
                    "telemetry {}: offset must be finite",
                    binding.topic
                )));
            }
        }

        Ok(Self {
            bindings: bindings.to_vec(),
            by_topic,
        })
    }

    /// Translate one inbound message.
    ///
    /// `Ok(None)` for topics that are not bound.
    pub fn route(&self, topic: &str, payload: &str) -> Result<Option<PointUpdate>> {
        let Some(binding) = self.by_topic.get(topic).map(|&i| &self.bindings[i]) else {
            trace!("No telemetry binding for {}", topic);
            return Ok(None);
        };

        let malformed = || BridgeError::malformed(topic, payload);
        let value = if binding.point_kind.is_binary() {
            // Scale and offset have no meaning for a status bit
            PointValue::Binary(parse_bool(payload).ok_or_else(malformed)?)
        } else {
            let raw = parse_number(payload).ok_or_else(malformed)?;
            PointValue::Analog(unit::to_engineering(raw, binding.scale, binding.offset))
        };

        Ok(Some(PointUpdate {
            point_index: binding.point_index,
            point_kind: binding.point_kind,
            value,
        }))
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.topic.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = PointKey> + '_ {
        self.bindings.iter().map(TelemetryBinding::key)
    }

    pub fn bindings(&self) -> &[TelemetryBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// ASCII decimal, exponent form allowed. NaN and infinities are rejected.
fn parse_number(payload: &str) -> Option<f64> {
    let text = payload.trim();
    let looks_decimal = !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if !looks_decimal {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_bool(payload: &str) -> Option<bool> {
    let text = payload.trim();
    if text.eq_ignore_ascii_case("on") || text.eq_ignore_ascii_case("true") || text == "1" {
        Some(true)
    } else if text.eq_ignore_ascii_case("off") || text.eq_ignore_ascii_case("false") || text == "0"
    {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const TOTAL_POWER: &str = "modbus/SungrowLogger/total_active_power/state";

    fn binding(topic: &str, index: u16, kind: PointKind, scale: f64) -> TelemetryBinding {
        TelemetryBinding {
            topic: topic.to_string(),
            point_index: index,
            point_kind: kind,
            scale,
            offset: 0.0,
            discovery: None,
        }
    }

    #[test]
    fn test_route_analog() {
        let map = TelemetryMap::bind(&[binding(TOTAL_POWER, 0, PointKind::AnalogInput, 1.0)]).unwrap();
        let update = map.route(TOTAL_POWER, "15000").unwrap().unwrap();
        assert_eq!(update.point_index, 0);
        assert_eq!(update.point_kind, PointKind::AnalogInput);
        assert_eq!(update.value, PointValue::Analog(15000.0));
    }

    #[test]
    fn test_route_applies_scale() {
        let map = TelemetryMap::bind(&[binding("meter/export", 2, PointKind::AnalogInput, 0.001)]).unwrap();
        let update = map.route("meter/export", " 125000 ").unwrap().unwrap();
        assert!((update.value.as_f64() - 125.0).abs() < 1e-9);
        let update = map.route("meter/export", "1.5e3").unwrap().unwrap();
        assert!((update.value.as_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_route_binary() {
        let map = TelemetryMap::bind(&[binding("plant/breaker", 0, PointKind::BinaryInput, 1.0)]).unwrap();
        for (payload, expected) in [("ON", true), ("off", false), ("true", true), ("0", false)] {
            let update = map.route("plant/breaker", payload).unwrap().unwrap();
            assert_eq!(update.value, PointValue::Binary(expected), "payload {}", payload);
        }
        assert!(matches!(
            map.route("plant/breaker", "maybe"),
            Err(BridgeError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_unmapped_topic_is_ignored() {
        let map = TelemetryMap::bind(&[binding(TOTAL_POWER, 0, PointKind::AnalogInput, 1.0)]).unwrap();
        assert_eq!(map.route("some/other/topic", "1").unwrap(), None);
    }

    #[test]
    fn test_malformed_numeric_payloads() {
        let map = TelemetryMap::bind(&[binding(TOTAL_POWER, 0, PointKind::AnalogInput, 1.0)]).unwrap();
        for payload in ["", "abc", "12kW", "NaN", "inf", "1e999"] {
            assert!(
                matches!(
                    map.route(TOTAL_POWER, payload),
                    Err(BridgeError::MalformedPayload { .. })
                ),
                "payload {:?} should be rejected",
                payload
            );
        }
    }

    #[test]
    fn test_bind_rejects_duplicates() {
        let err = TelemetryMap::bind(&[
            binding(TOTAL_POWER, 0, PointKind::AnalogInput, 1.0),
            binding(TOTAL_POWER, 1, PointKind::AnalogInput, 1.0),
        ])
        .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTopic(t) if t == TOTAL_POWER));

        let err = TelemetryMap::bind(&[
            binding("a", 0, PointKind::AnalogInput, 1.0),
            binding("b", 0, PointKind::AnalogInput, 1.0),
        ])
        .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicatePoint { index: 0, .. }));

        // Same index in another object group is a different point
        assert!(TelemetryMap::bind(&[
            binding("a", 0, PointKind::AnalogInput, 1.0),
            binding("b", 0, PointKind::BinaryInput, 1.0),
        ])
        .is_ok());
    }

    #[test]
    fn test_bind_rejects_zero_scale() {
        let err = TelemetryMap::bind(&[binding("a", 0, PointKind::AnalogInput, 0.0)]).unwrap_err();
        assert!(matches!(err, BridgeError::DivisionByZero(_)));
    }
}
