//! Bridge error types
//!
//! Configuration problems are fatal at startup. Everything raised while
//! running is either logged and dropped or mapped to a DNP3 command status.

use thiserror::Error;

use crate::core::control::ControlKind;
use crate::core::points::PointKind;
use crate::core::session::SessionState;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    // ============================================================================
    // Configuration
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate telemetry topic: {0}")]
    DuplicateTopic(String),

    #[error("Duplicate telemetry point: {kind} {index}")]
    DuplicatePoint { kind: PointKind, index: u16 },

    #[error("Duplicate control binding: point {point_index} {kind}")]
    DuplicateControl { point_index: u16, kind: ControlKind },

    #[error("Duplicate control output index: {0}")]
    DuplicateOutputIndex(u16),

    #[error("Division by zero: {0}")]
    DivisionByZero(String),

    #[error("Invalid plant limits: max {max_kw} kW, rated {rated_kw} kW, ramp step {ramp_step_kw} kW")]
    InvalidLimits {
        max_kw: f64,
        rated_kw: f64,
        ramp_step_kw: f64,
    },

    // ============================================================================
    // Telemetry and control
    // ============================================================================
    #[error("Malformed payload on {topic}: {payload:?}")]
    MalformedPayload { topic: String, payload: String },

    #[error("No baseline setpoint for point {0}")]
    NoBaselineSetpoint(u16),

    #[error("Unknown point: {kind} {index}")]
    UnknownPoint { kind: PointKind, index: u16 },

    // ============================================================================
    // Session
    // ============================================================================
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Outstation address mismatch: expected {expected}, request for {actual}")]
    AddressMismatch { expected: u16, actual: u16 },

    #[error("Session not online (state: {0})")]
    NotOnline(SessionState),

    // ============================================================================
    // Transports
    // ============================================================================
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("DNP3 stack error: {0}")]
    Stack(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn stack(msg: impl Into<String>) -> Self {
        Self::Stack(msg.into())
    }

    pub fn publish(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(topic: &str, payload: &str) -> Self {
        Self::MalformedPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    /// Configuration errors abort startup; everything else is a runtime condition.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::DuplicateTopic(_)
                | Self::DuplicatePoint { .. }
                | Self::DuplicateControl { .. }
                | Self::DuplicateOutputIndex(_)
                | Self::DivisionByZero(_)
                | Self::InvalidLimits { .. }
        )
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
