//! Bridge core: point model, mappings, safety limits and the session

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod control;
pub mod discovery;
pub mod events;
pub mod limiter;
pub mod modes;
pub mod points;
pub mod session;
pub mod telemetry;
pub mod unit;
