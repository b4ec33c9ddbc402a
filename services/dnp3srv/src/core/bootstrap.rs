//! Service bootstrap
//!
//! Command-line arguments and logging setup. Configuration loading itself
//! lives in [`super::config`].

use std::path::PathBuf;

use clap::Parser;
use common::logging::resolve_log_dir;
use common::LogConfig;
use tracing::{info, Level};

use super::config::{BridgeConfig, DEFAULT_CONFIG_PATH, SERVICE_NAME};
use crate::error::{BridgeError, Result};

/// Environment variable that overrides `logging.dir`
pub const LOG_DIR_ENV: &str = "DNP3SRV_LOG_DIR";

/// Command-line arguments for dnp3srv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dnp3srv",
    version = env!("CARGO_PKG_VERSION"),
    about = "DNP3 outstation bridge for MQTT plant telemetry",
    long_about = None
)]
pub struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log filter directive (overrides RUST_LOG), e.g. "debug" or "info,dnp3srv=trace"
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Run against the in-memory outstation instead of the TCP server
    #[arg(long)]
    pub simulate: bool,
}

/// Build the logger configuration from arguments and the `logging` section
pub fn log_config(args: &Args, config: &BridgeConfig) -> LogConfig {
    let logging = &config.logging;
    let log_dir = logging
        .file
        .then(|| resolve_log_dir(LOG_DIR_ENV, logging.dir.as_deref()));

    LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir,
        level: Level::INFO,
        debug: args.debug || logging.debug,
        filter: args.log_level.clone(),
        ansi: !args.no_color,
        enable_json: logging.json,
    }
}

pub fn initialize_logging(args: &Args, config: &BridgeConfig) -> Result<()> {
    let log_config = log_config(args, config);
    let log_dir = log_config.log_dir.clone();
    common::init_with_config(log_config)
        .map_err(|e| BridgeError::config(format!("Failed to init logging: {}", e)))?;

    match log_dir {
        Some(dir) => info!("Logging to {}", dir.display()),
        None => info!("File logging disabled"),
    }
    Ok(())
}

/// Summarise a validated configuration (used by `--validate`)
pub fn log_configuration(config: &BridgeConfig) {
    info!(
        "Outstation {} (master {}) on {}:{}, event buffer {}",
        config.outstation.address,
        config.outstation.master_address,
        config.outstation.listen_ip,
        config.outstation.listen_port,
        config.outstation.event_buffer_size
    );
    info!(
        "MQTT broker {}:{} as {}",
        config.mqtt.host, config.mqtt.port, config.mqtt.client_id
    );
    for binding in &config.telemetry {
        info!("  {} -> {}", binding.topic, binding.key());
    }
    for binding in &config.controls {
        info!(
            "  output {} ({} {}) -> {}",
            binding.output_index,
            binding.point_index,
            binding.kind,
            binding.targets.join(", ")
        );
    }
    info!(
        "Limits: max {} kW, rated {} kW, ramp step {} kW",
        config.limits.max_active_power_kw,
        config.limits.rated_nominal_power_kw,
        config.ramp_step_kw
    );
    if let Some(modes) = &config.modes {
        for point in modes.points() {
            info!("  {} -> {}", point.name, point.key);
        }
    }
    if config.mqtt.discovery.enabled {
        info!(
            "Discovery under {}/<component>/{}",
            config.mqtt.discovery.prefix, config.mqtt.discovery.node_id
        );
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::BridgeSettings;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["dnp3srv"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.simulate);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_log_config_from_settings() {
        let mut settings = BridgeSettings::default();
        settings.logging.file = false;
        settings.logging.json = true;
        let config = settings.validate().unwrap();

        let args = Args::parse_from(["dnp3srv", "--no-color", "-l", "trace", "--debug"]);
        let log = log_config(&args, &config);
        assert_eq!(log.service_name, "dnp3srv");
        assert!(log.log_dir.is_none());
        assert!(!log.ansi);
        assert!(log.debug);
        assert!(log.enable_json);
        assert_eq!(log.filter.as_deref(), Some("trace"));
    }
}
