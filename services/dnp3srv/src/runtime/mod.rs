//! Runtime orchestration
//!
//! Task startup, the outbound publisher and graceful shutdown.

pub mod publisher;
pub mod service;

pub use publisher::run_publisher;
pub use service::{start_bridge_service, StackMode};
