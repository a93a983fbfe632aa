use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mqtt_session::config::{self, SupervisorConfig};
use mqtt_session::{logging, MessageStore, RumqttFactory, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args_os()
        .nth(1)
        .map(Into::into)
        .unwrap_or_else(config::default_config_path);
    let config = SupervisorConfig::load(&path)
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;

    let store = Arc::new(
        MessageStore::open(&config.database)
            .map_err(|e| eyre!("Failed to open {}: {}", config.database.display(), e))?,
    );
    let (supervisor, _handle) = Supervisor::new(config, Arc::new(RumqttFactory), store)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt"),
            Err(e) => error!("Unable to listen for interrupt: {}", e),
        }
        signal.cancel();
    });

    supervisor.run(shutdown).await?;
    info!("Stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    logging::init(logging::level_from_env());
    Ok(())
}
