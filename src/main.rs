// src/main.rs - farm host binary: config load, discovery, per-device workers
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use farmhost::{discovery, Fabricator, LogReporter, MachineStatus, StatusReporter};

#[derive(Parser, Debug)]
#[command(name = "farm-host", about = "Serial print-farm host")]
struct Args {
    /// Path to the TOML farm configuration
    #[arg(short, long, default_value = "farm.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    tracing::info!("starting farmhost");

    let config = farmhost::load_config(&args.config).map_err(|e| {
        tracing::error!("failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    match discovery::available_ports() {
        Ok(ports) => {
            for port in &ports {
                tracing::info!("serial port visible: {}", port.display());
            }
        }
        Err(e) => tracing::warn!("could not enumerate serial ports: {}", e),
    }

    let reporter: Arc<dyn StatusReporter> = Arc::new(LogReporter);
    let mut farm = Vec::new();
    for device_config in &config.devices {
        let device = discovery::build_device(device_config);
        tracing::info!(
            "registered device {} (id {}, {:?})",
            device.name(),
            device_config.id,
            device_config.kind
        );
        farm.push(Arc::new(Fabricator::new(
            device_config.id,
            device,
            reporter.clone(),
            config.data_dir.clone(),
        )));
    }

    // One worker per device: start the next queued job whenever the machine
    // is idle. Terminal states wait for an operator reset.
    for fabricator in &farm {
        let fabricator = fabricator.clone();
        tokio::spawn(async move {
            loop {
                if fabricator.status() == MachineStatus::Idle
                    && !fabricator.queue().is_empty().await
                {
                    match fabricator.begin().await {
                        Ok(outcome) => tracing::info!(
                            "{}: job ended {:?}; waiting for operator reset",
                            fabricator.name(),
                            outcome
                        ),
                        Err(e) => tracing::error!("{}: {}", fabricator.name(), e),
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
