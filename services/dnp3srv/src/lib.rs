//! DNP3 Outstation Bridge (`dnp3srv`)
//!
//! Exposes plant telemetry received over MQTT to a utility SCADA master as a
//! DNP3 outstation, and turns the master's analog output commands into
//! clamped, ramp-limited setpoints published back to MQTT.
//!
//! - [`core`]: point database, mappings, safety limiter, session and bridge
//! - [`protocols`]: the DNP3 stack seam and the MQTT client
//! - [`runtime`]: task wiring and graceful shutdown

pub mod core;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use crate::core::bridge::{Bridge, BridgeEvent, LinkEvent};
pub use crate::core::config::{BridgeConfig, BridgeSettings};
pub use crate::core::session::{AcceptStatus, OutstationSession, SessionState};
pub use crate::error::{BridgeError, Result};
