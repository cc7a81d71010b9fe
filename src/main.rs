use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plotter_zenoh_runtime::config::{ConfigError, MachineConfig, STEP_BRIDGE_PORT};
use plotter_zenoh_runtime::motor::stepbus::DEFAULT_BAUDRATE;
use plotter_zenoh_runtime::motor::{SimulatedSink, StepBus, StepBusError};
use plotter_zenoh_runtime::runtime;

#[derive(Parser, Debug)]
#[command(about = "Gantry pen plotter motion runtime")]
struct Args {
    /// Machine config (JSON); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Step bridge serial port (bare flag uses the default port); simulated output when omitted
    #[arg(short, long, num_args = 0..=1, default_missing_value = STEP_BRIDGE_PORT)]
    port: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match &args.port {
        Some(port) => match StepBus::open_with_baudrate(port, args.baud) {
            Ok(mut bus) => match check_ping(port, bus.ping()) {
                Ok(()) => runtime::run(config, bus).await,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Failed to open step bridge: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No serial port given, using simulated step output");
            runtime::run(config, SimulatedSink::new()).await
        }
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<MachineConfig, ConfigError> {
    let config = match &args.config {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Turn a ping result into a startup error, keeping the bus error text
fn check_ping(port: &str, ping: Result<bool, StepBusError>) -> Result<(), String> {
    match ping {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("Step bridge on {} did not answer ping", port)),
        Err(e) => Err(format!("Failed to ping step bridge on {}: {}", port, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_errors_keep_their_cause() {
        assert!(check_ping("/dev/ttyUSB0", Ok(true)).is_ok());

        let silent = check_ping("/dev/ttyUSB0", Ok(false)).unwrap_err();
        assert!(silent.contains("did not answer"));

        let broken = check_ping(
            "/dev/ttyUSB0",
            Err(StepBusError::ChecksumMismatch { id: 1 }),
        )
        .unwrap_err();
        assert!(broken.contains("Checksum mismatch for bridge 1"), "{}", broken);
    }
}
