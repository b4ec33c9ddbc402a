//! DNP3 stack seam
//!
//! The session only ever talks to a stack through [`OutstationStack`]. The
//! TCP implementation lives in `protocols::outstation_tcp`; [`MemoryStack`]
//! mirrors the database in memory and records every write, which is what the
//! tests and `--simulate` runs use.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::core::config::OutstationSettings;
use crate::core::points::{Point, PointKey, PointValue, Quality};
use crate::error::{BridgeError, Result};

/// Event generation for a single point write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Event only if the value differs from the stack's copy
    Detect,
    /// Always produce an event (used when replaying buffered events)
    Force,
    /// Static value only
    Suppress,
}

pub trait OutstationStack: Send + Sync {
    fn configure(&self, settings: &OutstationSettings) -> Result<()>;

    fn bind_point_database(&self, points: &[PointKey]) -> Result<()>;

    /// Analog input or analog output status write
    fn update_analog(
        &self,
        key: PointKey,
        value: f64,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    );

    /// Binary input or binary output status write
    fn update_binary(
        &self,
        key: PointKey,
        value: bool,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    );

    /// Return points to their restart state without generating events
    fn restart_points(&self, points: &[PointKey]);

    /// Push one point, dispatching on its value type. Valueless points are skipped.
    fn update_point(&self, point: &Point, mode: EventMode) {
        let timestamp = point.updated_at.unwrap_or_else(Utc::now);
        match point.value {
            Some(PointValue::Analog(v)) => {
                self.update_analog(point.key, v, point.quality, timestamp, mode)
            },
            Some(PointValue::Binary(b)) => {
                self.update_binary(point.key, b, point.quality, timestamp, mode)
            },
            None => {},
        }
    }
}

/// One write that reached the stack as an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub key: PointKey,
    pub value: PointValue,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub mode: EventMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirroredPoint {
    pub value: Option<PointValue>,
    pub quality: Quality,
}

#[derive(Debug, Default)]
struct MemoryState {
    settings: Option<OutstationSettings>,
    points: BTreeMap<PointKey, MirroredPoint>,
    transmissions: Vec<Transmission>,
}

/// In-memory stack
#[derive(Debug, Default)]
pub struct MemoryStack {
    state: Mutex<MemoryState>,
}

impl MemoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> Option<OutstationSettings> {
        self.state.lock().settings.clone()
    }

    pub fn point(&self, key: PointKey) -> Option<MirroredPoint> {
        self.state.lock().points.get(&key).copied()
    }

    pub fn point_count(&self) -> usize {
        self.state.lock().points.len()
    }

    /// Events handed to the stack so far, oldest first
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().transmissions.clone()
    }

    pub fn take_transmissions(&self) -> Vec<Transmission> {
        std::mem::take(&mut self.state.lock().transmissions)
    }

    fn write(
        &self,
        key: PointKey,
        value: PointValue,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    ) {
        let mut state = self.state.lock();
        let Some(mirrored) = state.points.get_mut(&key) else {
            warn!("Write to unbound point {} ignored", key);
            return;
        };

        let changed = mirrored.value != Some(value);
        mirrored.value = Some(value);
        mirrored.quality = quality;

        let emit = match mode {
            EventMode::Detect => changed,
            EventMode::Force => true,
            EventMode::Suppress => false,
        };
        if emit {
            state.transmissions.push(Transmission {
                key,
                value,
                quality,
                timestamp,
                mode,
            });
        }
    }
}

impl OutstationStack for MemoryStack {
    fn configure(&self, settings: &OutstationSettings) -> Result<()> {
        settings.listen_addr()?;
        self.state.lock().settings = Some(settings.clone());
        Ok(())
    }

    fn bind_point_database(&self, points: &[PointKey]) -> Result<()> {
        let mut state = self.state.lock();
        if state.settings.is_none() {
            return Err(BridgeError::stack("point database bound before configure"));
        }
        state.points = points
            .iter()
            .map(|key| {
                (
                    *key,
                    MirroredPoint {
                        value: None,
                        quality: Quality::Restart,
                    },
                )
            })
            .collect();
        Ok(())
    }

    fn update_analog(
        &self,
        key: PointKey,
        value: f64,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    ) {
        self.write(key, PointValue::Analog(value), quality, timestamp, mode);
    }

    fn update_binary(
        &self,
        key: PointKey,
        value: bool,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    ) {
        self.write(key, PointValue::Binary(value), quality, timestamp, mode);
    }

    fn restart_points(&self, points: &[PointKey]) {
        let mut state = self.state.lock();
        for key in points {
            if let Some(mirrored) = state.points.get_mut(key) {
                mirrored.value = None;
                mirrored.quality = Quality::Restart;
            }
        }
    }
}
