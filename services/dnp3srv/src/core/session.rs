//! Outstation session
//!
//! Owns the point database, the event buffer and the ramp baselines, and
//! tracks the link lifecycle:
//!
//! ```text
//! Offline -> Listening -> LinkUp -> Online <-> CommLost
//!                 ^          |                    |
//!                 +----------+ (address mismatch) |
//!        any state -> Offline on shutdown         |
//!                            LinkUp <-------------+ (reconnect)
//! ```
//!
//! Values are only pushed to the stack while `Online`. Whatever changed in
//! the meantime is buffered and replayed, in order, when the session comes
//! back online.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{BridgeConfig, OutstationSettings};
use super::control::{ControlKind, ControlMap, OutboundPublish};
use super::events::{EventBuffer, EventRecord};
use super::limiter::{RampTable, SafetyLimiter};
use super::modes::{self, ConstraintModes};
use super::points::{Point, PointDatabase, PointKey, PointKind, PointValue, Quality};
use crate::error::{BridgeError, Result};
use crate::protocols::stack::{EventMode, OutstationStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Offline,
    Listening,
    LinkUp,
    Online,
    CommLost,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Listening => "listening",
            Self::LinkUp => "link_up",
            Self::Online => "online",
            Self::CommLost => "comm_lost",
        };
        f.write_str(name)
    }
}

impl SessionState {
    fn can_enter(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Offline, Listening)
                | (Listening, LinkUp)
                | (CommLost, LinkUp)
                | (LinkUp, Online)
                | (LinkUp, Listening)
                | (LinkUp, CommLost)
                | (Online, CommLost)
                | (_, Offline)
        )
    }
}

/// Command status returned to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptStatus {
    Success,
    NotSupported,
    OutOfRange,
    HardwareFault,
}

impl fmt::Display for AcceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::NotSupported => "not_supported",
            Self::OutOfRange => "out_of_range",
            Self::HardwareFault => "hardware_fault",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRequest {
    pub point_index: u16,
    pub kind: ControlKind,
    /// Engineering value sent by the master (ignored for ramp kinds)
    pub requested: f64,
}

/// Result of an operate
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    pub status: AcceptStatus,
    pub accepted_kw: Option<f64>,
    /// Messages to queue, in order, before the session lock is released
    pub publishes: Vec<OutboundPublish>,
}

/// Last absolute time written by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    pub master_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl TimeSync {
    /// Master clock minus local clock
    pub fn offset_ms(&self) -> i64 {
        (self.master_time - self.received_at).num_milliseconds()
    }
}

impl ControlOutcome {
    fn rejected(status: AcceptStatus) -> Self {
        Self {
            status,
            accepted_kw: None,
            publishes: Vec::new(),
        }
    }
}

pub struct OutstationSession {
    settings: OutstationSettings,
    state: SessionState,
    /// Where a failed address check sends the session back to
    resume_state: SessionState,
    points: PointDatabase,
    events: EventBuffer,
    /// Highest event sequence already handed to the stack
    delivered_upto: u64,
    controls: ControlMap,
    limiter: SafetyLimiter,
    ramps: RampTable,
    modes: Option<ConstraintModes>,
    last_time_sync: Option<TimeSync>,
    stack: Arc<dyn OutstationStack>,
}

impl fmt::Debug for OutstationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutstationSession")
            .field("state", &self.state)
            .field("points", &self.points.len())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl OutstationSession {
    /// Configure the stack and bind every telemetry point, one analog output
    /// status point per controlled point index and the constraint mode inputs.
    pub fn new(config: &BridgeConfig, stack: Arc<dyn OutstationStack>) -> Result<Self> {
        let controls = ControlMap::bind(&config.controls)?;
        let limiter = SafetyLimiter::new(config.limits, config.ramp_step_kw)?;

        let mut keys: Vec<PointKey> = config.telemetry.iter().map(|t| t.key()).collect();
        keys.extend(
            controls
                .point_indexes()
                .into_iter()
                .map(|index| PointKey::new(PointKind::AnalogOutputStatus, index)),
        );
        if let Some(modes) = &config.modes {
            keys.extend(modes.keys());
        }
        keys.sort_unstable();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(BridgeError::config(
                "telemetry binding collides with a control status or mode point",
            ));
        }

        stack.configure(&config.outstation)?;
        stack.bind_point_database(&keys)?;
        info!(
            "Outstation {} configured: {} points, event buffer {}, limit {} kW, ramp step {} kW",
            config.outstation.address,
            keys.len(),
            config.outstation.event_buffer_size,
            limiter.limits().max_active_power_kw,
            limiter.ramp_step_kw()
        );

        Ok(Self {
            settings: config.outstation.clone(),
            state: SessionState::Offline,
            resume_state: SessionState::Listening,
            points: PointDatabase::new(keys),
            events: EventBuffer::new(config.outstation.event_buffer_size),
            delivered_upto: 0,
            controls,
            limiter,
            ramps: RampTable::new(),
            modes: config.modes.clone(),
            last_time_sync: None,
            stack,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == SessionState::Online
    }

    pub fn points(&self) -> &PointDatabase {
        &self.points
    }

    pub fn point(&self, kind: PointKind, index: u16) -> Option<&Point> {
        self.points.get(kind, index)
    }

    pub fn events(&self) -> &EventBuffer {
        &self.events
    }

    pub fn ramps(&self) -> &RampTable {
        &self.ramps
    }

    pub fn controls(&self) -> &ControlMap {
        &self.controls
    }

    pub fn last_time_sync(&self) -> Option<TimeSync> {
        self.last_time_sync
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_enter(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    // ============================================================================
    // Link lifecycle
    // ============================================================================

    pub fn start_listening(&mut self) -> Result<()> {
        self.transition(SessionState::Listening)?;
        info!(
            "Outstation listening on {}:{}",
            self.settings.listen_ip, self.settings.listen_port
        );
        Ok(())
    }

    /// Master connected; `destination` is the link address it addressed.
    pub fn link_up(&mut self, destination: u16, now: DateTime<Utc>) -> Result<()> {
        self.resume_state = self.state;
        self.transition(SessionState::LinkUp)?;

        if destination != self.settings.address {
            let fallback = self.resume_state;
            self.transition(fallback)?;
            warn!(
                "Rejecting link for address {} (outstation is {})",
                destination, self.settings.address
            );
            return Err(BridgeError::AddressMismatch {
                expected: self.settings.address,
                actual: destination,
            });
        }

        self.transition(SessionState::Online)?;
        let replayed = self.replay_pending();
        self.sync_static(now);
        info!("Master online, {} buffered events replayed", replayed);
        Ok(())
    }

    pub fn link_down(&mut self) -> Result<()> {
        if self.state == SessionState::CommLost {
            return Ok(());
        }
        self.transition(SessionState::CommLost)?;
        warn!("Master link lost, buffering events");
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if self.state != SessionState::Offline {
            info!("Session {} -> offline", self.state);
        }
        self.state = SessionState::Offline;
    }

    /// Hand every event not yet delivered to the stack, oldest first
    fn replay_pending(&mut self) -> usize {
        let mut replayed = 0;
        for record in self.events.since(self.delivered_upto) {
            match record.value {
                PointValue::Analog(v) => self.stack.update_analog(
                    record.key(),
                    v,
                    record.quality,
                    record.timestamp,
                    EventMode::Force,
                ),
                PointValue::Binary(b) => self.stack.update_binary(
                    record.key(),
                    b,
                    record.quality,
                    record.timestamp,
                    EventMode::Force,
                ),
            }
            replayed += 1;
        }
        self.delivered_upto = self.events.last_sequence();
        replayed
    }

    /// Bring the stack's static values and qualities up to date
    fn sync_static(&self, now: DateTime<Utc>) {
        for point in self.points.iter() {
            if point.value.is_some() {
                self.stack.update_point(point, EventMode::Suppress);
            }
        }
        debug!("Static database synchronised at {}", now);
    }

    // ============================================================================
    // Point I/O
    // ============================================================================

    /// Write a value. Returns the event sequence number if the value changed.
    pub fn update_point(
        &mut self,
        key: PointKey,
        value: PointValue,
        quality: Quality,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let applied = self.points.apply(key, value, quality, now)?;
        let sequence = applied
            .changed
            .then(|| self.events.push(key, value, quality, now));

        if self.is_online() {
            let mode = if applied.changed {
                EventMode::Detect
            } else {
                EventMode::Suppress
            };
            if let Some(point) = self.points.get(key.kind, key.index) {
                self.stack.update_point(point, mode);
            }
            if let Some(seq) = sequence {
                self.delivered_upto = seq;
            }
        }

        if let Some(seq) = sequence {
            debug!("{} = {} ({}), event {}", key, value, quality, seq);
        }
        Ok(sequence)
    }

    /// Change quality without touching values or producing events
    pub fn set_quality(&mut self, keys: &[PointKey], quality: Quality, now: DateTime<Utc>) -> usize {
        let touched = self.points.set_quality(keys, quality, now);
        if self.is_online() {
            for key in &touched {
                if let Some(point) = self.points.get(key.kind, key.index) {
                    self.stack.update_point(point, EventMode::Suppress);
                }
            }
        }
        touched.len()
    }

    /// Buffered events, for the master's event poll
    pub fn read_events(&self) -> Result<Vec<EventRecord>> {
        if !self.is_online() {
            return Err(BridgeError::NotOnline(self.state));
        }
        Ok(self.events.iter().cloned().collect())
    }

    /// Master acknowledged everything up to `upto`
    pub fn confirm_events(&mut self, upto: u64) -> Result<usize> {
        if !self.is_online() {
            return Err(BridgeError::NotOnline(self.state));
        }
        Ok(self.events.confirm(upto))
    }

    /// Master wrote its absolute time. The local clock is left alone.
    pub fn record_time_sync(&mut self, master_time: DateTime<Utc>, now: DateTime<Utc>) -> TimeSync {
        let sync = TimeSync {
            master_time,
            received_at: now,
        };
        info!(
            "Master wrote time {} (offset {} ms)",
            master_time.to_rfc3339(),
            sync.offset_ms()
        );
        self.last_time_sync = Some(sync);
        sync
    }

    /// Forget all values and events; ramp baselines survive
    pub fn cold_restart(&mut self) {
        let keys: Vec<PointKey> = self.points.keys().collect();
        self.events.clear();
        self.points.reset();
        self.delivered_upto = self.events.last_sequence();
        self.stack.restart_points(&keys);
        info!("Cold restart: {} points back to restart quality", keys.len());
    }

    // ============================================================================
    // Controls
    // ============================================================================

    /// Select of a select-before-operate pair. Nothing is committed.
    pub fn on_select(&self, request: &ControlRequest) -> AcceptStatus {
        if self.controls.resolve(request.point_index, request.kind).is_none() {
            return AcceptStatus::NotSupported;
        }
        match self.limiter.evaluate(
            request.kind,
            request.point_index,
            request.requested,
            self.ramps.get(request.point_index),
        ) {
            Ok(_) => AcceptStatus::Success,
            Err(_) => AcceptStatus::OutOfRange,
        }
    }

    /// Validate, clamp, commit and build the outbound messages for an operate
    pub fn on_control_request(&mut self, request: &ControlRequest, now: DateTime<Utc>) -> ControlOutcome {
        let ControlRequest {
            point_index,
            kind,
            requested,
        } = *request;

        let Some(binding) = self.controls.resolve(point_index, kind) else {
            warn!("Control {} {} not supported", point_index, kind);
            return ControlOutcome::rejected(AcceptStatus::NotSupported);
        };

        let accepted = match self
            .limiter
            .evaluate(kind, point_index, requested, self.ramps.get(point_index))
        {
            Ok(value) => value,
            Err(e) => {
                warn!("Control {} {} rejected: {}", point_index, kind, e);
                return ControlOutcome::rejected(AcceptStatus::OutOfRange);
            },
        };

        let mut publishes = self.controls.publish(binding, accepted);
        publishes.extend(self.controls.echo(binding, accepted));

        self.ramps.record(point_index, accepted, now);
        let status_key = PointKey::new(PointKind::AnalogOutputStatus, point_index);
        if let Err(e) = self.update_point(status_key, PointValue::Analog(accepted), Quality::Online, now) {
            warn!("Control status echo for {} failed: {}", status_key, e);
        }
        publishes.extend(self.update_modes(kind, accepted, now));

        if kind == ControlKind::SetpointAbsolute && accepted != requested {
            info!(
                "Control {} {}: requested {} kW, clamped to {} kW",
                point_index, kind, requested, accepted
            );
        } else {
            info!("Control {} {}: accepted {} kW", point_index, kind, accepted);
        }

        ControlOutcome {
            status: AcceptStatus::Success,
            accepted_kw: Some(accepted),
            publishes,
        }
    }

    /// Refresh the constraint mode inputs; returns a state message per change
    fn update_modes(&mut self, kind: ControlKind, accepted: f64, now: DateTime<Utc>) -> Vec<OutboundPublish> {
        let Some(indications) = self
            .modes
            .as_ref()
            .map(|m| m.evaluate(kind, accepted, self.limiter.limits()))
        else {
            return Vec::new();
        };

        let mut publishes = Vec::new();
        for indication in indications {
            match self.update_point(indication.key, PointValue::Binary(indication.active), Quality::Online, now) {
                Ok(Some(_)) => publishes.push(OutboundPublish::new(
                    indication.state_topic,
                    modes::payload(indication.active),
                )),
                Ok(None) => {},
                Err(e) => warn!("Mode {} not updated: {}", indication.key, e),
            }
        }
        publishes
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::{BridgeSettings, ControlBindingSettings};
    use crate::core::telemetry::TelemetryBinding;
    use crate::protocols::stack::MemoryStack;

    const AI0: PointKey = PointKey::new(PointKind::AnalogInput, 0);
    const AOS1: PointKey = PointKey::new(PointKind::AnalogOutputStatus, 1);
    const BI0: PointKey = PointKey::new(PointKind::BinaryInput, 0);
    const BI1: PointKey = PointKey::new(PointKind::BinaryInput, 1);

    fn config(buffer: usize) -> BridgeConfig {
        let mut settings = BridgeSettings::default();
        settings.outstation.event_buffer_size = buffer;
        settings.telemetry.push(TelemetryBinding {
            topic: "plant/power".to_string(),
            point_index: 0,
            point_kind: PointKind::AnalogInput,
            scale: 1.0,
            offset: 0.0,
            discovery: None,
        });
        settings.controls.push(ControlBindingSettings {
            name: None,
            point_index: 1,
            output_index: None,
            kind: ControlKind::SetpointAbsolute,
            targets: vec!["inv/set".to_string()],
            scale: 1000.0,
        });
        settings.controls.push(ControlBindingSettings {
            name: None,
            point_index: 1,
            output_index: Some(2),
            kind: ControlKind::RampUp,
            targets: vec!["inv/set".to_string()],
            scale: 1000.0,
        });
        settings.limits.generation_max_active_power_kw = 100.0;
        settings.limits.rated_total_nominal_active_power_kw = 120.0;
        settings.limits.ramp_step_kw = 10.0;
        settings.validate().unwrap()
    }

    fn session(buffer: usize) -> (OutstationSession, Arc<MemoryStack>) {
        let stack = Arc::new(MemoryStack::new());
        let session = OutstationSession::new(&config(buffer), stack.clone()).unwrap();
        (session, stack)
    }

    fn online(session: &mut OutstationSession) {
        session.start_listening().unwrap();
        session.link_up(101, Utc::now()).unwrap();
    }

    #[test]
    fn test_new_binds_stack() {
        let (session, stack) = session(20);
        assert_eq!(session.state(), SessionState::Offline);
        // AI0, AOS1, BI0, BI1
        assert_eq!(stack.point_count(), 4);
        assert_eq!(stack.settings().unwrap().address, 101);
        assert_eq!(session.point(PointKind::AnalogInput, 0).unwrap().quality, Quality::Restart);
    }

    #[test]
    fn test_lifecycle() {
        let (mut session, _stack) = session(20);
        assert!(matches!(
            session.link_up(101, Utc::now()),
            Err(BridgeError::InvalidTransition { .. })
        ));

        online(&mut session);
        assert_eq!(session.state(), SessionState::Online);

        session.link_down().unwrap();
        assert_eq!(session.state(), SessionState::CommLost);
        session.link_up(101, Utc::now()).unwrap();
        assert_eq!(session.state(), SessionState::Online);

        session.shutdown();
        assert_eq!(session.state(), SessionState::Offline);
    }

    #[test]
    fn test_address_mismatch_falls_back() {
        let (mut session, _stack) = session(20);
        session.start_listening().unwrap();
        let err = session.link_up(7, Utc::now()).unwrap_err();
        assert!(matches!(err, BridgeError::AddressMismatch { expected: 101, actual: 7 }));
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn test_same_value_twice_is_one_event() {
        let (mut session, _stack) = session(20);
        let now = Utc::now();
        let first = session.update_point(AI0, PointValue::Analog(42.0), Quality::Online, now).unwrap();
        let second = session.update_point(AI0, PointValue::Analog(42.0), Quality::Online, now).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(session.events().len(), 1);
    }

    #[test]
    fn test_buffer_keeps_most_recent() {
        let (mut session, _stack) = session(20);
        let now = Utc::now();
        for i in 0..25 {
            session
                .update_point(AI0, PointValue::Analog(f64::from(i)), Quality::Online, now)
                .unwrap();
        }
        assert_eq!(session.events().len(), 20);
        assert_eq!(session.events().iter().next().unwrap().value, PointValue::Analog(5.0));
    }

    #[test]
    fn test_comm_lost_buffers_then_replays() {
        let (mut session, stack) = session(20);
        online(&mut session);
        session.link_down().unwrap();
        stack.take_transmissions();

        let now = Utc::now();
        session.update_point(AI0, PointValue::Analog(7.0), Quality::Online, now).unwrap();
        assert_eq!(session.point(PointKind::AnalogInput, 0).unwrap().value, Some(PointValue::Analog(7.0)));
        assert!(stack.transmissions().is_empty());
        assert!(matches!(session.read_events(), Err(BridgeError::NotOnline(SessionState::CommLost))));

        session.link_up(101, now).unwrap();
        let sent = stack.transmissions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].value, PointValue::Analog(7.0));
        assert_eq!(sent[0].mode, EventMode::Force);

        let events = session.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(session.confirm_events(events[0].sequence).unwrap(), 1);
        assert!(session.events().is_empty());
    }

    #[test]
    fn test_replay_carries_quality_at_event_time() {
        let (mut session, stack) = session(20);
        online(&mut session);
        session.link_down().unwrap();
        stack.take_transmissions();

        let now = Utc::now();
        session.update_point(AI0, PointValue::Analog(7.0), Quality::Online, now).unwrap();
        // Broker drops before the master comes back
        session.set_quality(&[AI0], Quality::CommLost, now);

        session.link_up(101, now).unwrap();
        let sent = stack.transmissions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].quality, Quality::Online);
        assert_eq!(sent[0].mode, EventMode::Force);
        // Static value still reflects the current quality
        assert_eq!(stack.point(AI0).unwrap().quality, Quality::CommLost);
    }

    #[test]
    fn test_online_updates_are_transmitted_once() {
        let (mut session, stack) = session(20);
        online(&mut session);
        let now = Utc::now();
        session.update_point(AI0, PointValue::Analog(1.0), Quality::Online, now).unwrap();
        session.link_down().unwrap();
        session.link_up(101, now).unwrap();
        // Already delivered live, not replayed again
        assert_eq!(stack.transmissions().len(), 1);
    }

    #[test]
    fn test_control_commits_ramp_and_echo() {
        let (mut session, stack) = session(20);
        online(&mut session);
        let now = Utc::now();

        let outcome = session.on_control_request(
            &ControlRequest {
                point_index: 1,
                kind: ControlKind::SetpointAbsolute,
                requested: 150.0,
            },
            now,
        );
        assert_eq!(outcome.status, AcceptStatus::Success);
        assert_eq!(outcome.accepted_kw, Some(100.0));
        assert_eq!(
            outcome.publishes,
            vec![
                OutboundPublish::new("inv/set", "100000"),
                OutboundPublish::new("scada/production_constraint_mode/state", "OFF"),
                OutboundPublish::new("scada/power_gradient_constraint_mode/state", "OFF"),
            ]
        );
        assert_eq!(session.ramps().get(1).unwrap().last_commanded_kw, 100.0);
        assert_eq!(
            stack.point(AOS1).unwrap().value,
            Some(PointValue::Analog(100.0))
        );
    }

    #[test]
    fn test_modes_follow_accepted_controls() {
        let (mut session, stack) = session(20);
        online(&mut session);
        let now = Utc::now();
        let absolute = |requested| ControlRequest {
            point_index: 1,
            kind: ControlKind::SetpointAbsolute,
            requested,
        };

        session.on_control_request(&absolute(100.0), now);
        assert_eq!(stack.point(BI0).unwrap().value, Some(PointValue::Binary(false)));

        let outcome = session.on_control_request(&absolute(60.0), now);
        assert_eq!(
            &outcome.publishes[1..],
            &[OutboundPublish::new("scada/production_constraint_mode/state", "ON")]
        );
        assert_eq!(stack.point(BI0).unwrap().value, Some(PointValue::Binary(true)));

        let outcome = session.on_control_request(
            &ControlRequest {
                point_index: 1,
                kind: ControlKind::RampUp,
                requested: 0.0,
            },
            now,
        );
        assert_eq!(outcome.accepted_kw, Some(70.0));
        assert_eq!(
            &outcome.publishes[1..],
            &[OutboundPublish::new("scada/power_gradient_constraint_mode/state", "ON")]
        );
        assert_eq!(stack.point(BI1).unwrap().value, Some(PointValue::Binary(true)));
    }

    #[test]
    fn test_time_sync_recorded() {
        let (mut session, _stack) = session(20);
        let now = Utc::now();
        let master_time = now + chrono::Duration::milliseconds(1500);
        let sync = session.record_time_sync(master_time, now);
        assert_eq!(sync.offset_ms(), 1500);
        assert_eq!(session.last_time_sync(), Some(sync));
    }

    #[test]
    fn test_ramp_needs_baseline() {
        let (mut session, _stack) = session(20);
        let ramp = ControlRequest {
            point_index: 1,
            kind: ControlKind::RampUp,
            requested: 0.0,
        };
        assert_eq!(session.on_select(&ramp), AcceptStatus::OutOfRange);
        let outcome = session.on_control_request(&ramp, Utc::now());
        assert_eq!(outcome.status, AcceptStatus::OutOfRange);
        assert!(outcome.publishes.is_empty());
        assert!(session.ramps().is_empty());

        session.on_control_request(
            &ControlRequest {
                point_index: 1,
                kind: ControlKind::SetpointAbsolute,
                requested: 50.0,
            },
            Utc::now(),
        );
        let outcome = session.on_control_request(&ramp, Utc::now());
        assert_eq!(outcome.status, AcceptStatus::Success);
        assert_eq!(outcome.accepted_kw, Some(60.0));
    }

    #[test]
    fn test_unbound_control_not_supported() {
        let (mut session, _stack) = session(20);
        let request = ControlRequest {
            point_index: 1,
            kind: ControlKind::RampDown,
            requested: 0.0,
        };
        assert_eq!(session.on_select(&request), AcceptStatus::NotSupported);
        assert_eq!(
            session.on_control_request(&request, Utc::now()).status,
            AcceptStatus::NotSupported
        );
    }

    #[test]
    fn test_select_commits_nothing() {
        let (session, _stack) = session(20);
        let request = ControlRequest {
            point_index: 1,
            kind: ControlKind::SetpointAbsolute,
            requested: 40.0,
        };
        assert_eq!(session.on_select(&request), AcceptStatus::Success);
        assert!(session.ramps().is_empty());
        assert!(session.events().is_empty());
    }

    #[test]
    fn test_set_quality_produces_no_event() {
        let (mut session, _stack) = session(20);
        let now = Utc::now();
        session.update_point(AI0, PointValue::Analog(3.0), Quality::Online, now).unwrap();
        assert_eq!(session.set_quality(&[AI0], Quality::CommLost, now), 1);
        let point = session.point(PointKind::AnalogInput, 0).unwrap();
        assert_eq!(point.quality, Quality::CommLost);
        assert_eq!(point.value, Some(PointValue::Analog(3.0)));
        assert_eq!(session.events().len(), 1);
    }

    #[test]
    fn test_cold_restart_clears_events_keeps_ramps() {
        let (mut session, stack) = session(20);
        online(&mut session);
        let now = Utc::now();
        session.update_point(AI0, PointValue::Analog(3.0), Quality::Online, now).unwrap();
        session.on_control_request(
            &ControlRequest {
                point_index: 1,
                kind: ControlKind::SetpointAbsolute,
                requested: 20.0,
            },
            now,
        );

        session.cold_restart();
        assert!(session.events().is_empty());
        assert_eq!(session.point(PointKind::AnalogInput, 0).unwrap().quality, Quality::Restart);
        assert_eq!(stack.point(AI0).unwrap().quality, Quality::Restart);
        assert!(session.ramps().get(1).is_some());
    }
}
