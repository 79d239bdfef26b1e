//! The rendezvous daemon: binds the well-known UDP port and runs forever, matching hosts
//!  with joiners and relaying between paired clients. Takes no arguments; exits non-zero
//!  when the socket cannot be opened.

use std::sync::Arc;

use tracing::{info, Level};

use gamelink::server::config::ServerConfig;
use gamelink::server::rendezvous::RendezvousServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let config = Arc::new(ServerConfig::new());
    let server = RendezvousServer::bind(config).await?;
    info!("rendezvous server listening on {}", server.local_addr()?);

    server.run().await
}
