use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roboteq_zenoh_runtime::config::DriverConfig;

/// Roboteq motor controller driver
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON parameter file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the config file
    #[arg(short, long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match DriverConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No config file given, using defaults");
            DriverConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.serial_port = port;
    }

    if let Err(e) = roboteq_zenoh_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
