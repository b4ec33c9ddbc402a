//! Transports: the DNP3 stack seam and the MQTT client

pub mod mqtt;
#[cfg(feature = "dnp3-tcp")]
pub mod outstation_tcp;
pub mod stack;
