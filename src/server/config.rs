use std::net::SocketAddr;
use std::time::Duration;

use crate::wire::SERVER_PORT;

#[derive(Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    pub max_clients: usize,
    pub max_hosts_waiting: usize,

    /// clients silent for this long are swept from the table, their partner notified as if
    ///  they had quit
    pub stale_client_timeout: Duration,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], SERVER_PORT)),
            max_clients: 10_000,
            max_hosts_waiting: 100,
            stale_client_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
        }
    }
}
