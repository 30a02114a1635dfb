//! Standalone collaboration server.
//!
//! Configuration comes from the environment (`EASEL_BIND_ADDR`,
//! `EASEL_SESSION_BUFFER`, `EASEL_MAX_MESSAGE_BYTES`); Ctrl-C starts a
//! graceful drain.

use std::sync::Arc;

use easel_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("Starting easel-server on {}", config.bind_addr);

    let server = Arc::new(CollabServer::new(config));

    let handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, draining");
            handle.shutdown();
        }
    });

    server.run().await
}
