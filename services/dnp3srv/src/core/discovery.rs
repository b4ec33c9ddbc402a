//! Home Assistant MQTT discovery
//!
//! Each announced entity gets one retained JSON message on
//! `{prefix}/{component}/{node_id}/{name}/config`. The bridge queues them on
//! every broker connect, ahead of the `online` availability message.
//!
//! Announced entities:
//! - telemetry bindings that carry a `discovery` block (sensor)
//! - named controls, on their echo topic (sensor, kW)
//! - the constraint mode indications (binary sensor)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::config::{BridgeConfig, SERVICE_NAME};
use super::control::OutboundPublish;
use super::modes;
use crate::error::{BridgeError, Result};

const DEVICE_MODEL: &str = "DNP3 outstation bridge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub prefix: String,
    pub node_id: String,
    /// Device the entities are grouped under; also the `unique_id` prefix
    pub device_name: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "homeassistant".to_string(),
            node_id: "scada".to_string(),
            device_name: SERVICE_NAME.to_string(),
        }
    }
}

/// Optional sensor announcement on a telemetry binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDiscovery {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub component: Component,
    pub name: String,
    pub state_topic: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
}

#[derive(Serialize)]
struct Device<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
}

#[derive(Serialize)]
struct ConfigPayload<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: &'a str,
    availability_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    device: Device<'a>,
}

/// Entities to announce, in a stable order. Names must be unique.
pub fn entities(config: &BridgeConfig) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();

    for binding in &config.telemetry {
        if let Some(sensor) = &binding.discovery {
            entities.push(Entity {
                component: Component::Sensor,
                name: sensor.name.clone(),
                state_topic: binding.topic.clone(),
                unit: sensor.unit.clone(),
                device_class: sensor.device_class.clone(),
            });
        }
    }

    for binding in &config.controls {
        if let (Some(name), Some(state_topic)) = (&binding.name, &binding.state_topic) {
            entities.push(Entity {
                component: Component::Sensor,
                name: name.clone(),
                state_topic: state_topic.clone(),
                unit: Some("kW".to_string()),
                device_class: Some("power".to_string()),
            });
        }
    }

    if let Some(modes) = &config.modes {
        for point in modes.points() {
            entities.push(Entity {
                component: Component::BinarySensor,
                name: point.name.to_string(),
                state_topic: point.state_topic.clone(),
                unit: None,
                device_class: None,
            });
        }
    }

    let mut seen = HashSet::with_capacity(entities.len());
    for entity in &entities {
        if entity.name.trim().is_empty() || entity.name.contains('/') {
            return Err(BridgeError::config(format!(
                "invalid discovery entity name {:?}",
                entity.name
            )));
        }
        if !seen.insert(entity.name.as_str()) {
            return Err(BridgeError::config(format!(
                "duplicate discovery entity name {:?}",
                entity.name
            )));
        }
    }
    Ok(entities)
}

/// Retained config messages, empty when discovery is disabled
pub fn announcements(config: &BridgeConfig) -> Result<Vec<OutboundPublish>> {
    let settings = &config.mqtt.discovery;
    if !settings.enabled {
        return Ok(Vec::new());
    }
    let availability_topic = config.mqtt.availability_topic();

    entities(config)?
        .iter()
        .map(|entity| {
            let binary = entity.component == Component::BinarySensor;
            let payload = ConfigPayload {
                name: &entity.name,
                unique_id: format!("{}_{}", settings.device_name, entity.name),
                state_topic: &entity.state_topic,
                availability_topic: &availability_topic,
                device_class: entity.device_class.as_deref(),
                unit_of_measurement: entity.unit.as_deref(),
                payload_on: binary.then(|| modes::payload(true)),
                payload_off: binary.then(|| modes::payload(false)),
                device: Device {
                    identifiers: [settings.device_name.as_str()],
                    name: &settings.device_name,
                    manufacturer: SERVICE_NAME,
                    model: DEVICE_MODEL,
                },
            };
            let json = serde_json::to_string(&payload).map_err(|e| {
                BridgeError::config(format!("discovery payload for {}: {}", entity.name, e))
            })?;
            let topic = format!(
                "{}/{}/{}/{}/config",
                settings.prefix,
                entity.component.as_str(),
                settings.node_id,
                entity.name
            );
            Ok(OutboundPublish::new(topic, json))
        })
        .collect()
}
