//! Shared service plumbing for the bridge binaries
//!
//! - logging bootstrap (console + daily file)
//! - graceful shutdown on Ctrl+C / SIGTERM

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig, LoggingError};
