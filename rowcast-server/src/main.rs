//! Rowcast Server: standalone sync server for a demo `notes` collection.
//!
//! Configuration comes from the environment (`ROWCAST_BIND`,
//! `ROWCAST_OUTBOUND_CAPACITY`, `ROWCAST_MAX_SUBSCRIPTIONS`,
//! `ROWCAST_HEARTBEAT_SECS`, `ROWCAST_PRINCIPAL_HEADER`). Log output is
//! controlled with `RUST_LOG`.

mod note;

use log::{error, info};
use std::sync::Arc;

use note::Note;
use rowcast_sync::{AllowAll, MemoryStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Rowcast server on {}...", config.bind_addr);

    let store = Arc::new(MemoryStore::<Note>::new().with_validator(note::validate));
    let server = SyncServer::new(config, store, Arc::new(AllowAll));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    if let Err(e) = server.run_until(shutdown).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    let stats = server.stats().await;
    info!(
        "Server stopped: {} connections served, {} requests ({} rejected)",
        stats.total_connections, stats.total_requests, stats.rejected_requests
    );
}
