//! Place server: shared pixel canvas over WebSockets.
//!
//! Configured through `PLACE_*` environment variables (see
//! `place_sync::config`), logging through `RUST_LOG`.

use log::{error, info};
use std::process::ExitCode;

use place_sync::config::ServerConfig;
use place_sync::server::CanvasServer;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting place server...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &config.storage_path {
        Some(path) => info!("Persisting canvas to {}", path.display()),
        None => info!("No PLACE_STORAGE_PATH set, canvas is in-memory only"),
    }

    let server = match CanvasServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open pixel store: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing pending pixel writes");
            server.flush().await;
        }
    }

    ExitCode::SUCCESS
}
