//! Bridge orchestrator
//!
//! Both transports feed [`BridgeEvent`]s into [`Bridge::dispatch`], which
//! holds the only lock over the session. Each event runs to completion
//! under that lock, including queueing its outbound MQTT messages, so the
//! queue order is the commit order. The publisher task does the actual I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use super::config::BridgeConfig;
use super::control::OutboundPublish;
use super::discovery;
use super::points::{PointKey, Quality};
use super::session::{AcceptStatus, ControlRequest, OutstationSession};
use super::telemetry::TelemetryMap;
use crate::error::{BridgeError, Result};
use crate::protocols::stack::OutstationStack;

/// Connection changes reported by the DNP3 side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Listening,
    Connected { destination: u16 },
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Inbound MQTT message
    Telemetry { topic: String, payload: String },
    /// Select of a select-before-operate pair
    Select { output_index: u16, value: f64 },
    /// Operate (or direct operate)
    Operate { output_index: u16, value: f64 },
    Link(LinkEvent),
    /// MQTT broker connection gained or lost
    Broker { connected: bool },
    ColdRestart,
    /// Master wrote its absolute time (ms since the Unix epoch)
    TimeSync { millis: u64 },
}

struct BridgeState {
    session: OutstationSession,
    telemetry: TelemetryMap,
    telemetry_keys: Vec<PointKey>,
}

pub struct Bridge {
    state: Mutex<BridgeState>,
    outbound: mpsc::Sender<OutboundPublish>,
    availability_topic: String,
    subscriptions: Vec<String>,
    /// Retained discovery messages, queued on every broker connect
    announcements: Vec<OutboundPublish>,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        stack: Arc<dyn OutstationStack>,
        outbound: mpsc::Sender<OutboundPublish>,
    ) -> Result<Self> {
        let telemetry = TelemetryMap::bind(&config.telemetry)?;
        let session = OutstationSession::new(config, stack)?;
        let telemetry_keys = telemetry.keys().collect();
        let subscriptions = telemetry.topics().map(str::to_string).collect();
        let announcements = discovery::announcements(config)?;

        Ok(Self {
            state: Mutex::new(BridgeState {
                session,
                telemetry,
                telemetry_keys,
            }),
            outbound,
            availability_topic: config.mqtt.availability_topic(),
            subscriptions,
            announcements,
        })
    }

    /// Telemetry topics to subscribe to
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn availability(&self, online: bool) -> OutboundPublish {
        let payload = if online { "online" } else { "offline" };
        OutboundPublish::new(self.availability_topic.as_str(), payload)
    }

    /// Read-only access to the session, under the dispatch lock
    pub fn inspect<R>(&self, f: impl FnOnce(&OutstationSession) -> R) -> R {
        f(&self.state.lock().session)
    }

    /// Mutable access for operations that have no event of their own
    /// (event confirmation from a polling master)
    pub fn with_session<R>(&self, f: impl FnOnce(&mut OutstationSession) -> R) -> R {
        f(&mut self.state.lock().session)
    }

    /// Handle one event. Control events return the status for the master.
    pub fn dispatch(&self, event: BridgeEvent) -> Option<AcceptStatus> {
        match event {
            BridgeEvent::Telemetry { topic, payload } => {
                self.on_telemetry(&topic, &payload);
                None
            },
            BridgeEvent::Select {
                output_index,
                value,
            } => Some(self.on_select(output_index, value)),
            BridgeEvent::Operate {
                output_index,
                value,
            } => Some(self.on_operate(output_index, value)),
            BridgeEvent::Link(link) => {
                self.on_link(link);
                None
            },
            BridgeEvent::Broker { connected } => {
                self.on_broker(connected);
                None
            },
            BridgeEvent::ColdRestart => {
                self.state.lock().session.cold_restart();
                None
            },
            BridgeEvent::TimeSync { millis } => Some(self.on_time_sync(millis)),
        }
    }

    fn on_telemetry(&self, topic: &str, payload: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.telemetry.route(topic, payload) {
            Ok(Some(update)) => {
                if let Err(e) =
                    state
                        .session
                        .update_point(update.key(), update.value, Quality::Online, Utc::now())
                {
                    warn!("Telemetry {} not applied: {}", topic, e);
                }
            },
            Ok(None) => {},
            Err(e) => warn!("Dropping malformed payload: {}", e),
        }
    }

    fn on_select(&self, output_index: u16, value: f64) -> AcceptStatus {
        let state = self.state.lock();
        let Some((point_index, kind)) = state.session.controls().route(output_index) else {
            warn!("Select on unmapped output {}", output_index);
            return AcceptStatus::NotSupported;
        };
        let status = state.session.on_select(&ControlRequest {
            point_index,
            kind,
            requested: value,
        });
        debug!("Select output {} ({} {}): {}", output_index, point_index, kind, status);
        status
    }

    fn on_operate(&self, output_index: u16, value: f64) -> AcceptStatus {
        if self.outbound.is_closed() {
            error!("Publisher stopped, rejecting operate on output {}", output_index);
            return AcceptStatus::HardwareFault;
        }

        let mut state = self.state.lock();
        let Some((point_index, kind)) = state.session.controls().route(output_index) else {
            warn!("Operate on unmapped output {}", output_index);
            return AcceptStatus::NotSupported;
        };
        let outcome = state.session.on_control_request(
            &ControlRequest {
                point_index,
                kind,
                requested: value,
            },
            Utc::now(),
        );
        let dropped = self.enqueue_all(outcome.publishes);
        drop(state);

        if let Some(accepted) = outcome.accepted_kw.filter(|_| !dropped.is_empty()) {
            error!(
                "Accepted {} kW on output {} not queued for: {}",
                accepted,
                output_index,
                dropped.join(", ")
            );
        }
        outcome.status
    }

    fn on_time_sync(&self, millis: u64) -> AcceptStatus {
        let Some(master_time) = i64::try_from(millis)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
        else {
            warn!("Master wrote an unrepresentable time: {} ms", millis);
            return AcceptStatus::OutOfRange;
        };
        self.state.lock().session.record_time_sync(master_time, Utc::now());
        AcceptStatus::Success
    }

    fn on_link(&self, link: LinkEvent) {
        let mut state = self.state.lock();
        let session = &mut state.session;
        let result = match link {
            LinkEvent::Listening => session.start_listening(),
            LinkEvent::Connected { destination } => session.link_up(destination, Utc::now()),
            LinkEvent::Disconnected => session.link_down(),
            LinkEvent::Closed => {
                session.shutdown();
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!("Link event {:?} ignored: {}", link, e);
        }
    }

    fn on_broker(&self, connected: bool) {
        if connected {
            info!(
                "MQTT broker connected, announcing {} discovery entities",
                self.announcements.len()
            );
            let announcements = self.announcements.iter().cloned();
            self.enqueue_all(announcements.chain(std::iter::once(self.availability(true))));
            return;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let marked = state
            .session
            .set_quality(&state.telemetry_keys, Quality::CommLost, Utc::now());
        warn!("MQTT broker lost, {} telemetry points marked comm_lost", marked);
    }

    /// Queue one message for the publisher task
    pub fn enqueue(&self, message: OutboundPublish) -> Result<()> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(message) => BridgeError::publish(message.topic, "outbound queue full"),
            TrySendError::Closed(message) => BridgeError::publish(message.topic, "publisher stopped"),
        })
    }

    /// Queue messages in order. Returns the topics that could not be queued.
    pub fn enqueue_all(&self, messages: impl IntoIterator<Item = OutboundPublish>) -> Vec<String> {
        let mut dropped = Vec::new();
        for message in messages {
            if let Err(e) = self.enqueue(message) {
                error!("{}", e);
                if let BridgeError::Publish { topic, .. } = e {
                    dropped.push(topic);
                }
            }
        }
        dropped
    }
}
