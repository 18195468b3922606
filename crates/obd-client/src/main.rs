//! OBD-II Client - Main Entry Point

use obd_client::{init_logging, run, ClientConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    info!("=== OBD-II Client v{} ===", env!("CARGO_PKG_VERSION"));

    let path = std::env::args().nth(1);
    let config = ClientConfig::load(path.as_deref())?;
    info!(
        "Connecting to '{}' on {}",
        config.device_name, config.serial_device
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                on_signal.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    run(config, shutdown).await?;

    Ok(())
}
