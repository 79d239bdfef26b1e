use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::server::client_table::{ClientHandle, ClientStatus, ClientTable};
use crate::server::config::ServerConfig;
use crate::wire::endpoint::{PeerEndpoint, PAIRING_DATAGRAM_LEN};
use crate::wire::message_id::{is_relayed, MessageId};
use crate::wire::MAX_DATAGRAM_SIZE;

/// How often a partner is told about a quit or reset. The server itself never retransmits,
///  so the notification is simply sent redundantly.
const QUIT_NOTIFY_COUNT: usize = 3;

#[derive(Debug)]
pub struct Outgoing {
    pub to: PeerEndpoint,
    pub data: Bytes,
}

/// The matchmaking and relay state machine, separated from the socket so the dispatch logic
///  is testable without network I/O: every entry point appends the datagrams to emit to
///  `out`, and the caller drains them to the wire.
pub struct RendezvousCore {
    config: Arc<ServerConfig>,
    table: ClientTable,
}

impl RendezvousCore {
    pub fn new(config: Arc<ServerConfig>) -> RendezvousCore {
        RendezvousCore {
            table: ClientTable::new(config.max_clients, config.max_hosts_waiting),
            config,
        }
    }

    pub fn table(&self) -> &ClientTable {
        &self.table
    }

    pub fn on_datagram(&mut self, from: PeerEndpoint, data: &[u8], now: Instant, out: &mut Vec<Outgoing>) {
        let mut parse = data;
        let first_word = match parse.try_get_u32() {
            Ok(w) => w,
            Err(_) => {
                trace!("runt datagram from {:?}, dropping", from);
                return;
            }
        };

        if first_word != MessageId::Check as u32 {
            info!("received {} from {:?}", message_name(first_word), from);
        }

        let client = self.table.lookup(from);
        if let Some(handle) = client {
            self.table.touch(handle, now);
        }

        if first_word == MessageId::Connect as u32 {
            match client {
                None => {
                    if self.table.insert(from, now).is_some() {
                        info!("new client connected: {:?}", from);
                        out.push(Outgoing { to: from, data: Bytes::copy_from_slice(data) });
                    }
                    else {
                        warn!("client table full, rejecting {:?}", from);
                    }
                }
                Some(handle) => {
                    // a known endpoint re-connecting starts over: echo the ACK, then reset
                    //  the record and free a partner it may still have
                    info!("resetting already known client {:?}", from);
                    out.push(Outgoing { to: from, data: Bytes::copy_from_slice(data) });
                    if let Some(partner) = self.table.reset(handle) {
                        push_quit_notifications(partner, out);
                    }
                }
            }
            return;
        }

        let Some(handle) = client else {
            debug!("datagram from unknown endpoint {:?}, dropping", from);
            return;
        };

        match MessageId::try_from(first_word) {
            Ok(MessageId::Quit) => {
                if let Some(partner) = self.table.reset(handle) {
                    push_quit_notifications(partner, out);
                }
            }
            Ok(MessageId::StartHost) => {
                let status = self.table.get(handle).map(|r| r.status);
                if status == Some(ClientStatus::Free) {
                    if self.table.enqueue_waiting(handle) {
                        info!("client {:?} is now waiting as a host", from);
                        out.push(Outgoing { to: from, data: message_datagram(MessageId::StartHost) });
                    }
                    else {
                        warn!("waiting-host list full, ignoring startHost from {:?}", from);
                    }
                }
            }
            Ok(MessageId::CheckHost) => {
                // the pairing notification may have been lost on its way to the host -
                //  re-send it if a partner is already assigned
                if let Some(partner_ep) = self.partner_endpoint(handle) {
                    info!("re-sending pairing notification to host {:?}", from);
                    out.push(pairing_message(MessageId::RequestHost, from, partner_ep));
                }
            }
            Ok(MessageId::RequestHost) => {
                self.on_request_host(handle, from, out);
            }
            _ if is_relayed(first_word) => {
                if let Some(partner_ep) = self.partner_endpoint(handle) {
                    if first_word != MessageId::Check as u32 {
                        debug!("relaying datagram from {:?} to {:?}", from, partner_ep);
                    }
                    out.push(Outgoing { to: partner_ep, data: Bytes::copy_from_slice(data) });
                }
            }
            _ => {
                trace!("dropping out-of-band message {} from {:?}", first_word, from);
            }
        }
    }

    fn on_request_host(&mut self, handle: ClientHandle, from: PeerEndpoint, out: &mut Vec<Outgoing>) {
        let status = match self.table.get(handle) {
            Some(record) => record.status,
            None => return,
        };

        if status == ClientStatus::Free {
            match self.table.pop_waiting_host() {
                None => {
                    info!("no host waiting for joiner {:?}", from);
                    out.push(Outgoing { to: from, data: message_datagram(MessageId::NoHost) });
                }
                Some(host) => {
                    let host_ep = match self.table.get(host) {
                        Some(record) => record.endpoint,
                        None => return,
                    };
                    self.table.pair(handle, host);
                    info!("pairing host {:?} with joiner {:?}", host_ep, from);

                    // each side learns the other's externally observed endpoint for the
                    //  hole-punch attempt
                    out.push(pairing_message(MessageId::RequestHost, host_ep, from));
                    out.push(pairing_message(MessageId::FoundHost, from, host_ep));
                }
            }
        }
        else if let Some(partner_ep) = self.partner_endpoint(handle) {
            // retry from a joiner that missed the original notification
            info!("re-sending pairing notification to joiner {:?}", from);
            out.push(pairing_message(MessageId::FoundHost, from, partner_ep));
        }
    }

    /// Delete every record that has been silent past the stale timeout, notifying partners
    ///  as if the stale client had quit.
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        for handle in self.table.stale_handles(now, self.config.stale_client_timeout) {
            if let Some((record, partner)) = self.table.remove(handle) {
                info!("deleting stale client {:?}", record.endpoint);
                if let Some(partner_ep) = partner {
                    push_quit_notifications(partner_ep, out);
                }
            }
        }
    }

    fn partner_endpoint(&self, handle: ClientHandle) -> Option<PeerEndpoint> {
        let partner = self.table.get(handle)?.partner?;
        Some(self.table.get(partner)?.endpoint)
    }
}

fn message_datagram(id: MessageId) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(id.into());
    buf.freeze()
}

fn pairing_message(id: MessageId, to: PeerEndpoint, carried: PeerEndpoint) -> Outgoing {
    let mut buf = BytesMut::with_capacity(PAIRING_DATAGRAM_LEN);
    carried.ser_pairing(id, &mut buf);
    Outgoing { to, data: buf.freeze() }
}

fn push_quit_notifications(to: PeerEndpoint, out: &mut Vec<Outgoing>) {
    let data = message_datagram(MessageId::Quit);
    for _ in 0..QUIT_NOTIFY_COUNT {
        out.push(Outgoing { to, data: data.clone() });
    }
}

fn message_name(first_word: u32) -> String {
    match MessageId::try_from(first_word) {
        Ok(id) => format!("{:?}", id),
        Err(_) => format!("#{}", first_word),
    }
}


/// The long-running server: binds the well-known UDP port and drives [RendezvousCore] from a
///  single task, alternating between socket receive and the housekeeping tick.
pub struct RendezvousServer {
    config: Arc<ServerConfig>,
    socket: UdpSocket,
    core: RendezvousCore,
}

impl RendezvousServer {
    pub async fn bind(config: Arc<ServerConfig>) -> anyhow::Result<RendezvousServer> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        Ok(RendezvousServer {
            core: RendezvousCore::new(config.clone()),
            config,
            socket,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut out = Vec::new();
        let mut housekeeping = interval(self.config.sweep_interval);

        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            match PeerEndpoint::try_from_socket_addr(from) {
                                Ok(from) => self.core.on_datagram(from, &buf[..len], Instant::now(), &mut out),
                                Err(_) => debug!("dropping datagram from non-IPv4 source {}", from),
                            }
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    self.core.sweep(Instant::now(), &mut out);
                }
            }

            for outgoing in out.drain(..) {
                if let Err(e) = self.socket.send_to(&outgoing.data, outgoing.to.to_socket_addr()).await {
                    warn!("failed to send to {:?}: {}", outgoing.to, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use super::*;

    fn ep(n: u32) -> PeerEndpoint {
        PeerEndpoint { host: 0x0A00_0000 + n, port: 40_000 + n as u16 }
    }

    fn word(id: MessageId) -> Vec<u8> {
        u32::from(id).to_be_bytes().to_vec()
    }

    fn core() -> RendezvousCore {
        RendezvousCore::new(Arc::new(ServerConfig::new()))
    }

    /// connect both endpoints and run the startHost / requestHost exchange
    fn paired_core(host: PeerEndpoint, joiner: PeerEndpoint) -> RendezvousCore {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();

        core.on_datagram(host, &word(MessageId::Connect), now, &mut out);
        core.on_datagram(joiner, &word(MessageId::Connect), now, &mut out);
        core.on_datagram(host, &word(MessageId::StartHost), now, &mut out);
        out.clear();
        core.on_datagram(joiner, &word(MessageId::RequestHost), now, &mut out);
        assert_eq!(out.len(), 2);
        core
    }

    #[test]
    fn test_connect_creates_record_and_echoes() {
        let mut core = core();
        let mut out = Vec::new();

        core.on_datagram(ep(1), &word(MessageId::Connect), Instant::now(), &mut out);

        assert_eq!(core.table().len(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, ep(1));
        assert_eq!(out[0].data.as_ref(), word(MessageId::Connect).as_slice());
    }

    #[test]
    fn test_repeated_connect_resets_without_duplicating() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();

        for _ in 0..3 {
            core.on_datagram(ep(1), &word(MessageId::Connect), now, &mut out);
        }

        assert_eq!(core.table().len(), 1);
        core.table().assert_invariants();
    }

    #[test]
    fn test_happy_pairing() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();
        let (host, joiner) = (ep(1), ep(2));

        core.on_datagram(host, &word(MessageId::Connect), now, &mut out);
        core.on_datagram(joiner, &word(MessageId::Connect), now, &mut out);
        out.clear();

        core.on_datagram(host, &word(MessageId::StartHost), now, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, host);
        assert_eq!(out[0].data.as_ref(), word(MessageId::StartHost).as_slice());
        out.clear();

        core.on_datagram(joiner, &word(MessageId::RequestHost), now, &mut out);

        // the host learns the joiner's endpoint, the joiner learns the host's
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, host);
        let mut expected = Vec::new();
        expected.extend_from_slice(&u32::from(MessageId::RequestHost).to_be_bytes());
        expected.extend_from_slice(&joiner.host.to_be_bytes());
        expected.extend_from_slice(&joiner.port.to_be_bytes());
        assert_eq!(out[0].data.as_ref(), expected.as_slice());

        assert_eq!(out[1].to, joiner);
        let mut expected = Vec::new();
        expected.extend_from_slice(&u32::from(MessageId::FoundHost).to_be_bytes());
        expected.extend_from_slice(&host.host.to_be_bytes());
        expected.extend_from_slice(&host.port.to_be_bytes());
        assert_eq!(out[1].data.as_ref(), expected.as_slice());

        core.table().assert_invariants();
    }

    #[test]
    fn test_request_host_without_waiting_host() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();

        core.on_datagram(ep(1), &word(MessageId::Connect), now, &mut out);
        out.clear();

        core.on_datagram(ep(1), &word(MessageId::RequestHost), now, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.as_ref(), word(MessageId::NoHost).as_slice());
    }

    #[test]
    fn test_request_host_skips_tombstoned_hosts() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();
        let (stale_host, live_host, joiner) = (ep(1), ep(2), ep(3));

        for client in [stale_host, live_host, joiner] {
            core.on_datagram(client, &word(MessageId::Connect), now, &mut out);
        }
        core.on_datagram(stale_host, &word(MessageId::StartHost), now, &mut out);
        core.on_datagram(live_host, &word(MessageId::StartHost), now, &mut out);
        core.on_datagram(stale_host, &word(MessageId::Quit), now, &mut out);
        out.clear();

        core.on_datagram(joiner, &word(MessageId::RequestHost), now, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, live_host);
        assert_eq!(out[1].to, joiner);
        core.table().assert_invariants();
    }

    #[test]
    fn test_check_host_resends_pairing() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        core.on_datagram(host, &word(MessageId::CheckHost), Instant::now(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, host);
        assert_eq!(out[0].data.len(), PAIRING_DATAGRAM_LEN);
        assert_eq!(out[0].data[..4], u32::from(MessageId::RequestHost).to_be_bytes()[..]);
    }

    #[test]
    fn test_check_host_before_pairing_is_silent() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();

        core.on_datagram(ep(1), &word(MessageId::Connect), now, &mut out);
        out.clear();
        core.on_datagram(ep(1), &word(MessageId::CheckHost), now, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_request_host_retry_resends_found_host() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        core.on_datagram(joiner, &word(MessageId::RequestHost), Instant::now(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, joiner);
        assert_eq!(out[0].data[..4], u32::from(MessageId::FoundHost).to_be_bytes()[..]);
        core.table().assert_invariants();
    }

    #[test]
    fn test_payload_is_relayed_verbatim() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        core.on_datagram(host, &payload, Instant::now(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, joiner);
        assert_eq!(out[0].data.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_check_beacon_is_relayed() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        let mut beacon = Vec::new();
        for w in [u32::from(MessageId::Check), 1000, 42, 0, 5] {
            beacon.extend_from_slice(&w.to_be_bytes());
        }
        core.on_datagram(joiner, &beacon, Instant::now(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, host);
        assert_eq!(out[0].data.as_ref(), beacon.as_slice());
    }

    #[test]
    fn test_payload_without_partner_is_dropped() {
        let mut core = core();
        let now = Instant::now();
        let mut out = Vec::new();

        core.on_datagram(ep(1), &word(MessageId::Connect), now, &mut out);
        out.clear();
        core.on_datagram(ep(1), &1u32.to_be_bytes(), now, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_quit_notifies_partner_three_times() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        core.on_datagram(host, &word(MessageId::Quit), Instant::now(), &mut out);

        assert_eq!(out.len(), 3);
        for outgoing in &out {
            assert_eq!(outgoing.to, joiner);
            assert_eq!(outgoing.data.as_ref(), word(MessageId::Quit).as_slice());
        }
        core.table().assert_invariants();
    }

    #[test]
    fn test_reserved_band_is_dropped() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();

        for value in [10_000u32, 59_999, 65_534, u32::from(MessageId::HolePunched), u32::from(MessageId::SystemState)] {
            core.on_datagram(host, &value.to_be_bytes(), Instant::now(), &mut out);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_unknown_sender_is_ignored() {
        let mut core = core();
        let mut out = Vec::new();

        core.on_datagram(ep(9), &word(MessageId::StartHost), Instant::now(), &mut out);
        assert!(out.is_empty());
        assert_eq!(core.table().len(), 0);
    }

    #[test]
    fn test_sweep_removes_stale_and_notifies_partner() {
        let (host, joiner) = (ep(1), ep(2));
        let mut core = paired_core(host, joiner);
        let mut out = Vec::new();
        let t0 = Instant::now();

        // the joiner keeps talking, the host goes silent for the full stale timeout
        core.on_datagram(joiner, &word(MessageId::Ping), t0 + Duration::from_secs(300), &mut out);
        out.clear();

        core.sweep(t0 + Duration::from_secs(600), &mut out);

        assert_eq!(core.table().lookup(host), None);
        assert!(core.table().lookup(joiner).is_some());
        assert_eq!(out.len(), 3);
        for outgoing in &out {
            assert_eq!(outgoing.to, joiner);
            assert_eq!(outgoing.data.as_ref(), word(MessageId::Quit).as_slice());
        }
        core.table().assert_invariants();
    }

    #[test]
    fn test_sweep_before_timeout_keeps_clients() {
        let mut core = core();
        let t0 = Instant::now();
        let mut out = Vec::new();

        core.on_datagram(ep(1), &word(MessageId::Connect), t0, &mut out);
        out.clear();

        core.sweep(t0 + Duration::from_secs(599), &mut out);
        assert_eq!(core.table().len(), 1);
        assert!(out.is_empty());
    }
}
