use log::{info, warn};
use std::env;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match midi_fabric_lib::FabricConfig::load_from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[midi-fabric] {config_path} not usable ({e:#}); using defaults");
            midi_fabric_lib::FabricConfig::default()
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = config.log_level.as_deref() {
        builder.parse_filters(level);
    }
    builder.init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received, initiating shutdown...");
        let _ = shutdown_tx.send(true);
    }) {
        warn!("could not install Ctrl+C handler: {e}");
    }

    midi_fabric_lib::run_service_loop(config, shutdown_rx).await;
}
