//! DNP3 outstation bridge service

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use dnp3srv::core::bootstrap::{self, Args};
use dnp3srv::core::config::BridgeSettings;
use dnp3srv::runtime::{start_bridge_service, StackMode};

/// sysexits EX_CONFIG
const EXIT_CONFIG: u8 = 78;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = match BridgeSettings::load(&args.config).and_then(BridgeSettings::validate) {
        Ok(config) => config,
        Err(e) if e.is_configuration_error() => {
            // Logging is not up yet
            eprintln!("Invalid configuration {}: {}", args.config.display(), e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        },
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load {}", args.config.display()))
        },
    };

    bootstrap::initialize_logging(&args, &config)?;
    info!(
        "dnp3srv {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::log_configuration(&config);
        info!("Validation completed successfully");
        return Ok(ExitCode::SUCCESS);
    }

    let mode = if args.simulate {
        StackMode::Simulated
    } else {
        StackMode::Tcp
    };
    let decode_debug = args.debug || config.logging.debug;

    match start_bridge_service(
        config,
        mode,
        decode_debug,
        common::shutdown::wait_for_shutdown(),
    )
    .await
    {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_configuration_error() => {
            error!("Configuration rejected at startup: {}", e);
            Ok(ExitCode::from(EXIT_CONFIG))
        },
        Err(e) => Err(e.into()),
    }
}
