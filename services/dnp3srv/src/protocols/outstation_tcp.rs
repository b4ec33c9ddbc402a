//! DNP3 TCP outstation on top of the `dnp3` crate
//!
//! Link framing, keep-alives and object encoding all stay inside the crate.
//! This adapter only maps the bridge's points into the crate's database and
//! feeds control requests and connection changes back into the [`Bridge`].

use std::net::SocketAddr;
use std::sync::Arc;

use ::dnp3::app::control::*;
use ::dnp3::app::measurement::*;
use ::dnp3::app::*;
use ::dnp3::decode::*;
use ::dnp3::link::*;
use ::dnp3::outstation::database::*;
use ::dnp3::outstation::*;
use ::dnp3::outstation::ConnectionState;
use ::dnp3::tcp::*;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::bridge::{Bridge, BridgeEvent, LinkEvent};
use crate::core::config::OutstationSettings;
use crate::core::points::{PointKey, PointKind, Quality};
use crate::core::session::AcceptStatus;
use crate::error::{BridgeError, Result};
use crate::protocols::stack::{EventMode, OutstationStack};

/// Outstation served over TCP.
///
/// `configure` and `bind_point_database` only record what to build; the
/// server itself is created by [`TcpOutstation::start`] once the bridge that
/// handles its callbacks exists.
pub struct TcpOutstation {
    decode_debug: bool,
    settings: Mutex<Option<OutstationSettings>>,
    points: Mutex<Vec<PointKey>>,
    outstation: Mutex<Option<OutstationHandle>>,
    server: Mutex<Option<ServerHandle>>,
}

impl TcpOutstation {
    pub fn new(decode_debug: bool) -> Self {
        Self {
            decode_debug,
            settings: Mutex::new(None),
            points: Mutex::new(Vec::new()),
            outstation: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    pub async fn start(&self, bridge: Arc<Bridge>) -> Result<()> {
        let settings = self
            .settings
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::stack("outstation started before configure"))?;

        let mut config = OutstationConfig::new(
            EndpointAddress::try_new(settings.address)
                .map_err(|e| BridgeError::stack(format!("invalid outstation address: {}", e)))?,
            EndpointAddress::try_new(settings.master_address)
                .map_err(|e| BridgeError::stack(format!("invalid master address: {}", e)))?,
            event_buffer_config(settings.event_buffer_size),
        );
        if self.decode_debug {
            config.decode_level = DecodeLevel {
                application: AppDecodeLevel::ObjectValues,
                transport: TransportDecodeLevel::Nothing,
                link: LinkDecodeLevel::Nothing,
                physical: PhysDecodeLevel::Nothing,
            };
        }

        let mut server = Server::new_tcp_server(LinkErrorMode::Close, settings.listen_addr()?);
        let outstation = server
            .add_outstation(
                config,
                Box::new(BridgeApplication {
                    bridge: bridge.clone(),
                }),
                Box::new(BridgeInformation),
                Box::new(BridgeControlHandler {
                    bridge: bridge.clone(),
                }),
                Box::new(LinkListener {
                    bridge,
                    address: settings.address,
                }),
                AddressFilter::Any,
            )
            .map_err(|e| BridgeError::stack(format!("failed to add outstation: {}", e)))?;
        *self.outstation.lock() = Some(outstation);

        let points = self.points.lock().clone();
        self.with_database(|db| {
            for key in &points {
                add_point(db, *key);
            }
        });

        let handle = server
            .bind()
            .await
            .map_err(|e| BridgeError::stack(format!("failed to bind server: {}", e)))?;
        let bound = handle.local_addr();
        *self.server.lock() = Some(handle);

        match bound {
            Some(addr) => info!(
                "DNP3 outstation {} serving {} points on {}",
                settings.address,
                points.len(),
                addr
            ),
            None => info!(
                "DNP3 outstation {} serving {} points on {}:{}",
                settings.address,
                points.len(),
                settings.listen_ip,
                settings.listen_port
            ),
        }
        Ok(())
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(ServerHandle::local_addr)
    }

    /// Drop the server; every session and callback goes with it
    pub fn stop(&self) {
        if self.server.lock().take().is_some() {
            info!("DNP3 server stopped");
        }
        self.outstation.lock().take();
    }

    fn with_database(&self, f: impl FnMut(&mut Database)) {
        match self.outstation.lock().as_ref() {
            Some(handle) => handle.transaction(f),
            None => debug!("Outstation not started, database write skipped"),
        }
    }
}

impl OutstationStack for TcpOutstation {
    fn configure(&self, settings: &OutstationSettings) -> Result<()> {
        settings.listen_addr()?;
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }

    fn bind_point_database(&self, points: &[PointKey]) -> Result<()> {
        *self.points.lock() = points.to_vec();
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
        let flags = flags(quality);
        let time = time(timestamp);
        let options = update_options(mode);
        self.with_database(|db| match key.kind {
            PointKind::AnalogInput => {
                db.update(key.index, &AnalogInput::new(value, flags, time), options);
            },
            PointKind::AnalogOutputStatus => {
                db.update(key.index, &AnalogOutputStatus::new(value, flags, time), options);
            },
            _ => warn!("Analog value for binary point {} ignored", key),
        });
    }

    fn update_binary(
        &self,
        key: PointKey,
        value: bool,
        quality: Quality,
        timestamp: DateTime<Utc>,
        mode: EventMode,
    ) {
        let flags = flags(quality);
        let time = time(timestamp);
        let options = update_options(mode);
        self.with_database(|db| match key.kind {
            PointKind::BinaryInput => {
                db.update(key.index, &BinaryInput::new(value, flags, time), options);
            },
            PointKind::BinaryOutputStatus => {
                db.update(key.index, &BinaryOutputStatus::new(value, flags, time), options);
            },
            _ => warn!("Binary value for analog point {} ignored", key),
        });
    }

    fn restart_points(&self, points: &[PointKey]) {
        let now = Utc::now();
        for key in points {
            if key.kind.is_binary() {
                self.update_binary(*key, false, Quality::Restart, now, EventMode::Suppress);
            } else {
                self.update_analog(*key, 0.0, Quality::Restart, now, EventMode::Suppress);
            }
        }
    }
}

// ============================================================================
// Database mapping
// ============================================================================

fn add_point(db: &mut Database, key: PointKey) {
    let class = Some(EventClass::Class1);
    let added = match key.kind {
        PointKind::AnalogInput => db.add(
            key.index,
            class,
            AnalogInputConfig {
                s_var: StaticAnalogInputVariation::Group30Var5,
                e_var: EventAnalogInputVariation::Group32Var7,
                deadband: 0.0,
            },
        ),
        PointKind::BinaryInput => db.add(key.index, class, BinaryInputConfig::default()),
        PointKind::AnalogOutputStatus => {
            db.add(key.index, class, AnalogOutputStatusConfig::default())
        },
        PointKind::BinaryOutputStatus => {
            db.add(key.index, class, BinaryOutputStatusConfig::default())
        },
    };
    if !added {
        warn!("Point {} already present in outstation database", key);
    }
}

fn event_buffer_config(size: usize) -> EventBufferConfig {
    let size = u16::try_from(size).unwrap_or(u16::MAX);
    EventBufferConfig::new(
        size, // binary
        0,    // double-bit binary
        size, // binary output status
        0,    // counter
        0,    // frozen counter
        size, // analog
        size, // analog output status
        0,    // octet string
    )
}

fn flags(quality: Quality) -> Flags {
    match quality {
        Quality::Online => Flags::ONLINE,
        Quality::Restart => Flags::RESTART,
        Quality::CommLost => Flags::COMM_LOST,
        Quality::LocalForced => Flags::LOCAL_FORCED,
        Quality::RemoteForced => Flags::REMOTE_FORCED,
    }
}

fn time(timestamp: DateTime<Utc>) -> Time {
    let millis = u64::try_from(timestamp.timestamp_millis()).unwrap_or(0);
    Time::synchronized(millis)
}

fn update_options(mode: EventMode) -> UpdateOptions {
    match mode {
        EventMode::Detect => UpdateOptions::detect_event(),
        EventMode::Force => UpdateOptions::new(true, ::dnp3::outstation::database::EventMode::Force),
        EventMode::Suppress => {
            UpdateOptions::new(true, ::dnp3::outstation::database::EventMode::Suppress)
        },
    }
}

// ============================================================================
// Callbacks
// ============================================================================

struct BridgeApplication {
    bridge: Arc<Bridge>,
}

impl OutstationApplication for BridgeApplication {
    fn write_absolute_time(&mut self, written: Timestamp) -> std::result::Result<(), RequestError> {
        match self.bridge.dispatch(BridgeEvent::TimeSync {
            millis: written.raw_value(),
        }) {
            Some(AcceptStatus::Success) => Ok(()),
            _ => Err(RequestError::ParameterError),
        }
    }

    fn cold_restart(&mut self) -> Option<RestartDelay> {
        self.bridge.dispatch(BridgeEvent::ColdRestart);
        Some(RestartDelay::Seconds(1))
    }
}

struct BridgeInformation;
impl OutstationInformation for BridgeInformation {}

struct LinkListener {
    bridge: Arc<Bridge>,
    address: u16,
}

impl Listener<ConnectionState> for LinkListener {
    fn update(&mut self, value: ConnectionState) -> MaybeAsync<()> {
        let event = match value {
            // The server only routes frames addressed to this outstation
            ConnectionState::Connected => LinkEvent::Connected {
                destination: self.address,
            },
            ConnectionState::Disconnected => LinkEvent::Disconnected,
        };
        self.bridge.dispatch(BridgeEvent::Link(event));
        MaybeAsync::ready(())
    }
}

struct BridgeControlHandler {
    bridge: Arc<Bridge>,
}

impl BridgeControlHandler {
    fn select_output(&self, index: u16, value: f64) -> CommandStatus {
        command_status(self.bridge.dispatch(BridgeEvent::Select {
            output_index: index,
            value,
        }))
    }

    fn operate_output(&self, index: u16, value: f64) -> CommandStatus {
        command_status(self.bridge.dispatch(BridgeEvent::Operate {
            output_index: index,
            value,
        }))
    }
}

fn command_status(status: Option<AcceptStatus>) -> CommandStatus {
    match status {
        Some(AcceptStatus::Success) => CommandStatus::Success,
        Some(AcceptStatus::OutOfRange) => CommandStatus::OutOfRange,
        Some(AcceptStatus::HardwareFault) => CommandStatus::HardwareError,
        Some(AcceptStatus::NotSupported) | None => CommandStatus::NotSupported,
    }
}

impl ControlHandler for BridgeControlHandler {}

// No binary controls are bridged
impl ControlSupport<Group12Var1> for BridgeControlHandler {
    fn select(&mut self, _control: Group12Var1, _index: u16, _database: &mut DatabaseHandle) -> CommandStatus {
        CommandStatus::NotSupported
    }

    fn operate(
        &mut self,
        _control: Group12Var1,
        _index: u16,
        _op_type: OperateType,
        _database: &mut DatabaseHandle,
    ) -> CommandStatus {
        CommandStatus::NotSupported
    }
}

macro_rules! analog_output_support {
    ($($variation:ty),+) => {
        $(
            impl ControlSupport<$variation> for BridgeControlHandler {
                fn select(
                    &mut self,
                    control: $variation,
                    index: u16,
                    _database: &mut DatabaseHandle,
                ) -> CommandStatus {
                    self.select_output(index, f64::from(control.value))
                }

                fn operate(
                    &mut self,
                    control: $variation,
                    index: u16,
                    _op_type: OperateType,
                    _database: &mut DatabaseHandle,
                ) -> CommandStatus {
                    self.operate_output(index, f64::from(control.value))
                }
            }
        )+
    };
}

analog_output_support!(Group41Var1, Group41Var2, Group41Var3, Group41Var4);

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::BridgeSettings;
    use crate::core::telemetry::TelemetryBinding;
    use tokio::sync::mpsc;

    const AI0: PointKey = PointKey::new(PointKind::AnalogInput, 0);

    fn loopback_bridge() -> (Arc<TcpOutstation>, Arc<Bridge>) {
        let mut settings = BridgeSettings::default();
        settings.outstation.listen_ip = "127.0.0.1".to_string();
        settings.outstation.listen_port = 0;
        settings.telemetry.push(TelemetryBinding {
            topic: "plant/power".to_string(),
            point_index: 0,
            point_kind: PointKind::AnalogInput,
            scale: 1.0,
            offset: 0.0,
            discovery: None,
        });
        let config = settings.validate().unwrap();
        let stack = Arc::new(TcpOutstation::new(false));
        let (tx, _rx) = mpsc::channel(8);
        let bridge = Arc::new(Bridge::new(&config, stack.clone(), tx).unwrap());
        (stack, bridge)
    }

    #[tokio::test]
    async fn test_serves_bound_points_on_loopback() {
        let (stack, bridge) = loopback_bridge();
        stack.start(bridge).await.unwrap();
        let addr = stack.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        stack.update_analog(AI0, 1500.0, Quality::Online, Utc::now(), EventMode::Detect);
        let stored = stack
            .outstation
            .lock()
            .as_ref()
            .unwrap()
            .transaction(|db| Get::<AnalogInput>::get(db, 0))
            .unwrap();
        assert_eq!(stored.value, 1500.0);
        assert_eq!(stored.flags, Flags::ONLINE);

        stack.stop();
        assert!(stack.local_addr().is_none());
    }

    #[test]
    fn test_write_before_start_is_skipped() {
        let stack = TcpOutstation::new(false);
        stack.update_analog(AI0, 1.0, Quality::Online, Utc::now(), EventMode::Detect);
        assert!(stack.local_addr().is_none());
    }

    #[test]
    fn test_time_is_synchronized_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert!(matches!(
            time(at),
            Time::Synchronized(ts) if ts.raw_value() == 1_700_000_000_123
        ));
    }

    #[test]
    fn test_command_status_mapping() {
        assert_eq!(command_status(Some(AcceptStatus::Success)), CommandStatus::Success);
        assert_eq!(command_status(Some(AcceptStatus::OutOfRange)), CommandStatus::OutOfRange);
        assert_eq!(
            command_status(Some(AcceptStatus::HardwareFault)),
            CommandStatus::HardwareError
        );
        assert_eq!(command_status(None), CommandStatus::NotSupported);
    }
}
