//! Outstation control points to MQTT setpoint commands
//!
//! A control binding is addressed by the master through its DNP3 output
//! index and identified internally by `(point_index, kind)`. Several kinds
//! may share one `point_index`; they then share one ramp baseline.
//!
//! `scale` is raw actuator units per engineering unit, e.g. `1000` for an
//! inverter that takes watts while the bridge reasons in kW.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::unit;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    SetpointAbsolute,
    RampUp,
    RampDown,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SetpointAbsolute => "setpoint_absolute",
            Self::RampUp => "ramp_up",
            Self::RampDown => "ramp_down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlBinding {
    pub name: Option<String>,
    pub point_index: u16,
    /// DNP3 analog output index operated by the master
    pub output_index: u16,
    pub kind: ControlKind,
    /// Publish targets, in order
    pub targets: Vec<String>,
    pub scale: f64,
    /// Echo topic for the accepted engineering value
    pub state_topic: Option<String>,
}

impl ControlBinding {
    pub fn is_active(&self) -> bool {
        !self.targets.is_empty()
    }
}

/// One MQTT message produced by an accepted control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: String,
}

impl OutboundPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControlMap {
    bindings: Vec<ControlBinding>,
    by_key: HashMap<(u16, ControlKind), usize>,
    by_output: HashMap<u16, usize>,
}

impl ControlMap {
    pub fn bind(bindings: &[ControlBinding]) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(bindings.len());
        let mut by_output = HashMap::with_capacity(bindings.len());

        for (position, binding) in bindings.iter().enumerate() {
            if by_key
                .insert((binding.point_index, binding.kind), position)
                .is_some()
            {
                return Err(BridgeError::DuplicateControl {
                    point_index: binding.point_index,
                    kind: binding.kind,
                });
            }
            if by_output.insert(binding.output_index, position).is_some() {
                return Err(BridgeError::DuplicateOutputIndex(binding.output_index));
            }
            unit::validate_scale(
                &format!("control {} {}", binding.point_index, binding.kind),
                binding.scale,
            )?;
            if let Some(empty) = binding.targets.iter().find(|t| t.trim().is_empty()) {
                return Err(BridgeError::config(format!(
                    "control {} {} has an empty target topic {:?}",
                    binding.point_index, binding.kind, empty
                )));
            }
        }

        Ok(Self {
            bindings: bindings.to_vec(),
            by_key,
            by_output,
        })
    }

    /// Active binding for `(point_index, kind)`
    pub fn resolve(&self, point_index: u16, kind: ControlKind) -> Option<&ControlBinding> {
        self.by_key
            .get(&(point_index, kind))
            .map(|&i| &self.bindings[i])
            .filter(|b| b.is_active())
    }

    /// Binding key behind a DNP3 output index
    pub fn route(&self, output_index: u16) -> Option<(u16, ControlKind)> {
        self.by_output.get(&output_index).map(|&i| {
            let binding = &self.bindings[i];
            (binding.point_index, binding.kind)
        })
    }

    /// One message per target carrying the same actuator value
    pub fn publish(&self, binding: &ControlBinding, engineering: f64) -> Vec<OutboundPublish> {
        let payload = unit::format_decimal(unit::to_actuator(engineering, binding.scale));
        binding
            .targets
            .iter()
            .map(|topic| OutboundPublish::new(topic.as_str(), payload.as_str()))
            .collect()
    }

    /// Debug mirror of the accepted engineering value, if the binding is named
    pub fn echo(&self, binding: &ControlBinding, engineering: f64) -> Option<OutboundPublish> {
        binding
            .state_topic
            .as_ref()
            .map(|topic| OutboundPublish::new(topic.as_str(), unit::format_decimal(engineering)))
    }

    /// Point indexes with at least one active binding
    pub fn point_indexes(&self) -> Vec<u16> {
        let mut indexes: Vec<u16> = self
            .bindings
            .iter()
            .filter(|b| b.is_active())
            .map(|b| b.point_index)
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }

    pub fn bindings(&self) -> &[ControlBinding] {
        &self.bindings
    }
}
