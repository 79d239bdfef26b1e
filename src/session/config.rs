use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use tokio::net::lookup_host;

use crate::wire::SERVER_PORT;

#[derive(Debug)]
pub struct SessionConfig {
    /// rendezvous server, `host` or `host:port`; resolved against [SERVER_PORT] when no
    ///  port is given
    pub server_url: String,

    /// The local bind address. The protocol does not care about the local port, so the
    ///  default is an ephemeral one - a fixed port would limit a machine to one session.
    pub local_bind_addr: SocketAddr,

    pub handshake_retry_interval: Duration,
    pub handshake_timeout: Duration,

    pub hole_punch_send_interval: Duration,
    /// baseline punch deadline; extended by one more interval each time a peer `connect`
    ///  arrives, to tolerate NAT setup jitter
    pub hole_punch_deadline: Duration,

    pub beacon_interval: Duration,
    /// beacon cadence while packets are known to be missing on either side
    pub beacon_interval_catch_up: Duration,

    /// cadence of the lone ping that keeps the server's NAT mapping alive while traffic
    ///  flows peer-to-peer
    pub server_keepalive_interval: Duration,

    /// silence on the socket past this duration raises `ConnectionLost`
    pub connection_loss_timeout: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> SessionConfig {
        SessionConfig {
            server_url: server_url.into(),
            local_bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake_retry_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            hole_punch_send_interval: Duration::from_millis(100),
            hole_punch_deadline: Duration::from_secs(1),
            beacon_interval: Duration::from_millis(500),
            beacon_interval_catch_up: Duration::from_millis(200),
            server_keepalive_interval: Duration::from_secs(30),
            connection_loss_timeout: Duration::from_secs(2),
        }
    }

    pub(crate) async fn resolve_server_addr(&self) -> anyhow::Result<SocketAddr> {
        let target = if self.server_url.contains(':') {
            self.server_url.clone()
        }
        else {
            format!("{}:{}", self.server_url, SERVER_PORT)
        };

        let result = lookup_host(&target).await?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| anyhow!("could not resolve server address {:?}", self.server_url));
        result
    }
}
