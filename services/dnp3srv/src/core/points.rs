//! Outstation point database
//!
//! Points are keyed by `(kind, index)`: DNP3 indexes are scoped per object
//! group, so analog input 0 and analog output status 0 are distinct points.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// DNP3 point type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    AnalogInput,
    BinaryInput,
    AnalogOutputStatus,
    BinaryOutputStatus,
}

impl PointKind {
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryInput | Self::BinaryOutputStatus)
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AnalogInput => "analog_input",
            Self::BinaryInput => "binary_input",
            Self::AnalogOutputStatus => "analog_output_status",
            Self::BinaryOutputStatus => "binary_output_status",
        };
        f.write_str(name)
    }
}

/// Point quality, reduced to the flags the bridge sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Online,
    Restart,
    CommLost,
    LocalForced,
    RemoteForced,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Restart => "restart",
            Self::CommLost => "comm_lost",
            Self::LocalForced => "local_forced",
            Self::RemoteForced => "remote_forced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Analog(f64),
    Binary(bool),
}

impl PointValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Analog(v) => *v,
            Self::Binary(b) => f64::from(u8::from(*b)),
        }
    }

    fn fits(&self, kind: PointKind) -> bool {
        matches!(self, Self::Binary(_)) == kind.is_binary()
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analog(v) => write!(f, "{}", v),
            Self::Binary(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointKey {
    pub kind: PointKind,
    pub index: u16,
}

impl PointKey {
    pub const fn new(kind: PointKind, index: u16) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for PointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.index)
    }
}

/// One outstation point
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub key: PointKey,
    /// `None` until the first real update
    pub value: Option<PointValue>,
    pub updated_at: Option<DateTime<Utc>>,
    pub quality: Quality,
}

impl Point {
    fn restarted(key: PointKey) -> Self {
        Self {
            key,
            value: None,
            updated_at: None,
            quality: Quality::Restart,
        }
    }
}

/// Result of writing a value into the database
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    /// The value differs from the previous one (first update always counts)
    pub changed: bool,
}

/// Point storage owned by the session
#[derive(Debug, Clone, Default)]
pub struct PointDatabase {
    points: BTreeMap<PointKey, Point>,
}

impl PointDatabase {
    /// Database containing every key, all in `restart` quality
    pub fn new(keys: impl IntoIterator<Item = PointKey>) -> Self {
        let points = keys
            .into_iter()
            .map(|key| (key, Point::restarted(key)))
            .collect();
        Self { points }
    }

    pub fn get(&self, kind: PointKind, index: u16) -> Option<&Point> {
        self.points.get(&PointKey::new(kind, index))
    }

    pub fn contains(&self, key: &PointKey) -> bool {
        self.points.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = PointKey> + '_ {
        self.points.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Write value, quality and time in one step.
    pub fn apply(
        &mut self,
        key: PointKey,
        value: PointValue,
        quality: Quality,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let point = self
            .points
            .get_mut(&key)
            .ok_or(BridgeError::UnknownPoint {
                kind: key.kind,
                index: key.index,
            })?;
        if !value.fits(key.kind) {
            return Err(BridgeError::config(format!(
                "value {} does not match point type {}",
                value, key
            )));
        }

        let changed = point.value != Some(value);
        point.value = Some(value);
        point.quality = quality;
        point.updated_at = Some(now);
        Ok(Applied { changed })
    }

    /// Change quality only; values are kept.
    ///
    /// Returns the keys that actually changed quality.
    pub fn set_quality(
        &mut self,
        keys: &[PointKey],
        quality: Quality,
        now: DateTime<Utc>,
    ) -> Vec<PointKey> {
        let mut touched = Vec::new();
        for key in keys {
            if let Some(point) = self.points.get_mut(key) {
                if point.quality != quality {
                    point.quality = quality;
                    point.updated_at = Some(now);
                    touched.push(*key);
                }
            }
        }
        touched
    }

    /// Every point back to its cold-start state
    pub fn reset(&mut self) {
        for point in self.points.values_mut() {
            *point = Point::restarted(point.key);
        }
    }
}
