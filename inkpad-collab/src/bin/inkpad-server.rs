//! inkpad collaboration server.
//!
//! Configuration comes from environment variables:
//!
//! - `INKPAD_BIND`       — listen address (default `127.0.0.1:9090`)
//! - `INKPAD_DATA_DIR`   — storage directory; unset runs without persistence
//! - `INKPAD_FLUSH_MS`   — flush debounce in milliseconds (default 500)
//! - `INKPAD_IDLE_SECS`  — idle room grace period in seconds (default 30)
//! - `RUST_LOG`          — log filter (e.g. `info`, `inkpad_collab=debug`)

use std::path::PathBuf;
use std::time::Duration;

use inkpad_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("INKPAD_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(dir) = std::env::var("INKPAD_DATA_DIR") {
        config.storage_path = Some(PathBuf::from(dir));
    }
    if let Ok(ms) = std::env::var("INKPAD_FLUSH_MS") {
        match ms.parse::<u64>() {
            Ok(ms) => config.flush_debounce = Duration::from_millis(ms),
            Err(_) => log::warn!("Ignoring invalid INKPAD_FLUSH_MS={ms}"),
        }
    }
    if let Ok(secs) = std::env::var("INKPAD_IDLE_SECS") {
        match secs.parse::<u64>() {
            Ok(secs) => config.idle_grace = Duration::from_secs(secs),
            Err(_) => log::warn!("Ignoring invalid INKPAD_IDLE_SECS={secs}"),
        }
    }

    match &config.storage_path {
        Some(path) => log::info!("Persistence enabled at {}", path.display()),
        None => log::info!("Running without persistence"),
    }

    let server = SyncServer::new(config);
    server.run().await
}
