use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};

use crate::session::config::SessionConfig;
use crate::session::events::SessionEvent;
use crate::session::handshake::{self, Established};
use crate::session::recv_state::{PayloadDisposition, RecvState};
use crate::session::send_state::SendState;
use crate::session::shared::{PauseState, Role, SessionShared};
use crate::session::sync_state::{HashRing, PingTracker, SyncTracker};
use crate::wire::beacon::CheckPacket;
use crate::wire::message_id::{is_payload_sequence, MessageId};
use crate::wire::MAX_DATAGRAM_SIZE;

/// One end of a 1:1 game connection. Created per call to [Session::start_host] or
///  [Session::connect_to_host]; owns the UDP socket and the background engine task
///  exclusively, and lives until [Session::close].
///
/// Establishment progress and steady-state incidents arrive on the event channel supplied
///  at creation; application payload flows through [Session::add_to_send_buf] /
///  [Session::send_packet] outbound and [Session::pull_message] / [Session::read_message]
///  inbound.
pub struct Session {
    shared: Arc<SessionShared>,
    inbox: mpsc::UnboundedReceiver<u32>,
    engine: Option<JoinHandle<()>>,
    is_host: bool,
}

impl Session {
    /// Advertise as a host: connect to the rendezvous server, register on its waiting list
    ///  and wait for a joiner. Returns as soon as the engine task is running; progress is
    ///  reported through `events`.
    pub async fn start_host(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> anyhow::Result<Session> {
        Self::start(config, events, Role::Host).await
    }

    /// Ask the rendezvous server for the next waiting host and connect to it.
    pub async fn connect_to_host(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> anyhow::Result<Session> {
        Self::start(config, events, Role::Joiner).await
    }

    async fn start(config: SessionConfig, events: mpsc::Sender<SessionEvent>, role: Role) -> anyhow::Result<Session> {
        let config = Arc::new(config);
        let server_addr = config.resolve_server_addr().await?;
        let socket = UdpSocket::bind(config.local_bind_addr).await?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        let shared = Arc::new(SessionShared {
            config,
            socket,
            server_addr,
            partner_addr: RwLock::new(None),
            p2p: AtomicBool::new(false),
            send: Mutex::new(SendState::new()),
            hashes: RwLock::new(HashRing::new()),
            ping: RwLock::new(PingTracker::new()),
            in_sync: AtomicBool::new(true),
            pause: RwLock::new(PauseState::Running),
            clock_epoch: RwLock::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            inbox_tx,
            events,
        });

        let engine = tokio::spawn(run_engine(shared.clone(), role));

        Ok(Session {
            shared,
            inbox,
            engine: Some(engine),
            is_host: role == Role::Host,
        })
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Append one word to the outbound buffer. Words past the 512-byte datagram budget are
    ///  dropped - flush with [Session::send_packet] in time.
    pub async fn add_to_send_buf(&self, word: u32) {
        self.shared.send.lock().await.add_word(word);
    }

    /// Flush the outbound buffer as one payload datagram to the current target (the peer
    ///  when a direct connection exists, the relay otherwise) and retain a copy for
    ///  retransmission.
    pub async fn send_packet(&self) -> anyhow::Result<()> {
        let target = self.shared.target_addr().await;

        // holding the send lock across the socket write keeps flushes and engine
        //  retransmissions from interleaving
        let mut send = self.shared.send.lock().await;
        let packet = send.take_packet();
        match self.shared.socket.send_to(&packet.data, target).await {
            Ok(_) => {
                trace!("sent payload #{} ({} bytes)", packet.sequence, packet.data.len());
                Ok(())
            }
            Err(e) => {
                // the copy stays retained - the reliability protocol will deliver it
                error!("failed to send payload #{}: {}", packet.sequence, e);
                Err(e.into())
            }
        }
    }

    /// Pop the next inbound word if one is available.
    pub fn pull_message(&mut self) -> Option<u32> {
        self.inbox.try_recv().ok()
    }

    /// Wait for the next inbound word. `None` once the session is closed and the mailbox
    ///  drained.
    pub async fn read_message(&mut self) -> Option<u32> {
        self.inbox.recv().await
    }

    /// Record the newest application state hash for desync detection against the peer.
    pub async fn update_hash(&self, hash: u32) {
        self.shared.hashes.write().await.push(hash);
    }

    pub fn players_in_sync(&self) -> bool {
        self.shared.in_sync.load(Ordering::Acquire)
    }

    /// Round-trip estimate in milliseconds (exponentially weighted moving average).
    pub async fn ping_ms(&self) -> f32 {
        self.shared.ping.read().await.ping_ms()
    }

    /// Suspend hash-mismatch accounting until [Session::unpause].
    pub async fn pause(&self) {
        *self.shared.pause.write().await = PauseState::Indefinite;
    }

    /// Suspend hash-mismatch accounting for a fixed duration.
    pub async fn pause_for(&self, duration: Duration) {
        *self.shared.pause.write().await = PauseState::Until(Instant::now() + duration);
    }

    pub async fn unpause(&self) {
        *self.shared.pause.write().await = PauseState::Running;
    }

    pub async fn paused(&self) -> bool {
        self.shared.paused().await
    }

    /// Reset the session clock at the start of a new game so both peers' beacon clocks
    ///  start over together.
    pub async fn new_game(&self) {
        *self.shared.clock_epoch.write().await = Instant::now();
    }

    /// Tell the server (and the peer, when connected directly) that we are leaving, then
    ///  stop the engine task and wait for it to finish.
    pub async fn close(&mut self) {
        for _ in 0..3 {
            if let Err(e) = self.shared.send_message(MessageId::Quit, self.shared.server_addr).await {
                warn!("failed to send quit to server: {}", e);
            }
        }
        if self.shared.p2p.load(Ordering::Acquire) {
            if let Some(partner) = *self.shared.partner_addr.read().await {
                for _ in 0..3 {
                    if let Err(e) = self.shared.send_message(MessageId::Quit, partner).await {
                        warn!("failed to send quit to peer: {}", e);
                    }
                }
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.shutdown_notify.notify_one();
        if let Some(engine) = self.engine.take() {
            engine.await.ok();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(engine) = &self.engine {
            engine.abort();
        }
    }
}


async fn run_engine(shared: Arc<SessionShared>, role: Role) {
    let established = match role {
        Role::Host => handshake::establish_host(&shared).await,
        Role::Joiner => handshake::establish_joiner(&shared).await,
    };

    match established {
        Established::Ready => steady_state(&shared).await,
        Established::Finished => {}
    }
    debug!("session engine exiting");
}

/// Mutable state of the steady-state loop, owned by the engine task alone.
struct EngineState {
    recv: RecvState,
    sync: SyncTracker,
    /// the peer's report of how far it has contiguously received our stream; drives the
    ///  beacon cadence
    peer_min_rcvd: u32,
    beacon_due: Instant,
    keepalive_due: Instant,
    last_rx: Instant,
    connected: bool,
}

/// The fast cadence applies whenever either side is known to be waiting for packets.
fn catch_up_needed(recv: &RecvState, peer_min_rcvd: u32, send_count: u32) -> bool {
    recv.has_missing() || peer_min_rcvd != send_count
}

async fn steady_state(shared: &Arc<SessionShared>) {
    let now = Instant::now();
    let mut state = EngineState {
        recv: RecvState::new(),
        sync: SyncTracker::new(),
        peer_min_rcvd: 0,
        beacon_due: now + shared.config.beacon_interval,
        keepalive_due: now + shared.config.server_keepalive_interval,
        last_rx: now,
        connected: true,
    };
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        if shared.is_shut_down() {
            break;
        }
        let now = Instant::now();

        if state.connected && now >= state.last_rx + shared.config.connection_loss_timeout {
            state.connected = false;
            shared.emit(SessionEvent::ConnectionLost).await;
        }

        if now >= state.beacon_due {
            send_beacon(shared, &state.recv).await;
            let send_count = shared.send.lock().await.send_count();
            let interval = if catch_up_needed(&state.recv, state.peer_min_rcvd, send_count) {
                shared.config.beacon_interval_catch_up
            }
            else {
                shared.config.beacon_interval
            };
            state.beacon_due = now + interval;
        }

        let p2p = shared.p2p.load(Ordering::Acquire);
        if p2p && now >= state.keepalive_due {
            // keep the server's NAT mapping alive while traffic bypasses the relay
            if let Err(e) = shared.send_message(MessageId::Ping, shared.server_addr).await {
                error!("failed to send server keepalive: {}", e);
            }
            state.keepalive_due = now + shared.config.server_keepalive_interval;
        }

        let mut wake = state.beacon_due;
        if p2p {
            wake = wake.min(state.keepalive_due);
        }
        if state.connected {
            wake = wake.min(state.last_rx + shared.config.connection_loss_timeout);
        }

        select! {
            _ = shared.shutdown_notify.notified() => {
                break;
            }
            _ = sleep_until(wake) => {}
            received = shared.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        state.last_rx = Instant::now();
                        if !state.connected {
                            state.connected = true;
                            shared.emit(SessionEvent::Reconnected).await;
                        }
                        handle_datagram(shared, &mut state, &buf[..len], from).await;
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_datagram(shared: &SessionShared, state: &mut EngineState, data: &[u8], from: SocketAddr) {
    let mut parse = data;
    let first_word = match parse.try_get_u32() {
        Ok(w) => w,
        Err(_) => {
            trace!("runt datagram from {}, dropping", from);
            return;
        }
    };

    match MessageId::try_from(first_word) {
        Ok(MessageId::Check) => {
            on_beacon(shared, state, parse).await;
        }
        Ok(MessageId::Quit) => {
            shared.emit(SessionEvent::PlayerQuit).await;
        }
        Ok(MessageId::Ping) => {
            // a ping carrying a clock answers one of our beacons; the lone keepalive
            //  variant carries nothing and is ignored
            if let Ok(echoed) = parse.try_get_u32() {
                let rtt = shared.clock_ms().await.wrapping_sub(echoed);
                shared.ping.write().await.on_sample(rtt as f32);
            }
        }
        Ok(_) => {
            trace!("dropping control message {} from {}", first_word, from);
        }
        Err(_) if is_payload_sequence(first_word) => {
            match state.recv.on_payload_sequence(first_word) {
                PayloadDisposition::Duplicate => {
                    trace!("dropping duplicate payload #{}", first_word);
                }
                PayloadDisposition::Accept { ack_now } => {
                    if ack_now {
                        // acknowledge quickly so the sender learns about gaps
                        state.beacon_due = Instant::now();
                    }
                    while parse.remaining() >= 4 {
                        let word = parse.get_u32();
                        if word == MessageId::NewGame as u32 {
                            shared.emit(SessionEvent::NewGame).await;
                        }
                        if shared.inbox_tx.send(word).is_err() {
                            trace!("mailbox closed, dropping inbound word");
                        }
                    }
                }
            }
        }
        Err(_) => {
            trace!("dropping out-of-band message {} from {}", first_word, from);
        }
    }
}

async fn on_beacon(shared: &SessionShared, state: &mut EngineState, mut parse: &[u8]) {
    let beacon = match CheckPacket::try_deser(&mut parse) {
        Ok(beacon) => beacon,
        Err(e) => {
            debug!("malformed check beacon: {}", e);
            return;
        }
    };

    let target = shared.target_addr().await;

    // answer the peer's clock so it can measure the round trip
    shared.send_ping_echo(beacon.clock_ms, target).await;

    // state hash comparison against our recent history
    let paused = shared.paused().await;
    let in_sync = {
        let ring = shared.hashes.read().await;
        state.sync.on_peer_hash(&ring, beacon.state_hash, paused)
    };
    shared.in_sync.store(in_sync, Ordering::Release);

    // the peer's watermark proves receipt below it; NAK'ed payloads are re-sent verbatim
    state.peer_min_rcvd = beacon.min_pack_rcvd;
    {
        let mut send = shared.send.lock().await;
        send.prune_acknowledged(beacon.min_pack_rcvd);

        for &sequence in &beacon.missing {
            match send.stored(sequence) {
                Some(data) => {
                    debug!("retransmitting payload #{}", sequence);
                    if let Err(e) = shared.socket.send_to(data, target).await {
                        error!("failed to retransmit payload #{}: {}", sequence, e);
                    }
                }
                None => {
                    debug!("peer NAK'ed #{} which is no longer retained", sequence);
                }
            }
        }
    }

    // the peer may have emitted payloads nothing of which has reached us yet
    if state.recv.on_peer_send_count(beacon.send_count) {
        state.beacon_due = Instant::now();
    }
}

async fn send_beacon(shared: &SessionShared, recv: &RecvState) {
    let beacon = CheckPacket {
        clock_ms: shared.clock_ms().await,
        state_hash: shared.hashes.read().await.newest(),
        min_pack_rcvd: recv.min_pack_rcvd(),
        send_count: shared.send.lock().await.send_count(),
        missing: recv.missing_ids(),
    };

    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
    beacon.ser(&mut buf);

    let target = shared.target_addr().await;
    if let Err(e) = shared.socket.send_to(&buf, target).await {
        error!("failed to send check beacon: {}", e);
    }
}
