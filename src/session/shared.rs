use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{error, trace};

use crate::session::config::SessionConfig;
use crate::session::events::SessionEvent;
use crate::session::send_state::SendState;
use crate::session::sync_state::{HashRing, PingTracker};
use crate::wire::message_id::MessageId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Role {
    Host,
    Joiner,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PauseState {
    Running,
    Until(Instant),
    Indefinite,
}

/// State shared between the application-facing [super::connection::Session] handle and the
///  background engine task. The socket is owned here and used from both sides; the send
///  state sits under one mutex so that application flushes and engine retransmissions
///  serialize against each other; `p2p` and the partner address are the only establishment
///  results the steady-state send path needs.
pub(crate) struct SessionShared {
    pub config: Arc<SessionConfig>,
    pub socket: UdpSocket,
    pub server_addr: SocketAddr,

    pub partner_addr: RwLock<Option<SocketAddr>>,
    /// whether outbound traffic goes to the peer directly instead of through the relay
    pub p2p: AtomicBool,

    pub send: Mutex<SendState>,
    pub hashes: RwLock<HashRing>,
    pub ping: RwLock<PingTracker>,
    pub in_sync: AtomicBool,
    pub pause: RwLock<PauseState>,

    /// origin of the session clock carried in beacons and ping echos; reset by `new_game`
    pub clock_epoch: RwLock<Instant>,

    pub shutdown: AtomicBool,
    pub shutdown_notify: Notify,

    pub inbox_tx: mpsc::UnboundedSender<u32>,
    pub events: mpsc::Sender<SessionEvent>,
}

impl SessionShared {
    /// Where regular traffic goes: the peer once the hole punch succeeded, the relay
    ///  otherwise.
    pub async fn target_addr(&self) -> SocketAddr {
        if self.p2p.load(Ordering::Acquire) {
            if let Some(addr) = *self.partner_addr.read().await {
                return addr;
            }
        }
        self.server_addr
    }

    pub async fn clock_ms(&self) -> u32 {
        self.clock_epoch.read().await.elapsed().as_millis() as u32
    }

    pub async fn paused(&self) -> bool {
        match *self.pause.read().await {
            PauseState::Running => false,
            PauseState::Indefinite => true,
            PauseState::Until(deadline) => Instant::now() < deadline,
        }
    }

    /// Send a single-word control datagram.
    pub async fn send_message(&self, id: MessageId, to: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(id.into());
        self.socket.send_to(&buf, to).await?;
        Ok(())
    }

    /// Send a `ping` carrying an echoed clock value, the answer to a beacon's clock field.
    pub async fn send_ping_echo(&self, clock_ms: u32, to: SocketAddr) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(MessageId::Ping.into());
        buf.put_u32(clock_ms);
        if let Err(e) = self.socket.send_to(&buf, to).await {
            error!("failed to send ping echo: {}", e);
        }
    }

    pub async fn emit(&self, event: SessionEvent) {
        trace!("emitting {:?}", event);
        if self.events.send(event).await.is_err() {
            trace!("event sink closed, dropping {:?}", event);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
