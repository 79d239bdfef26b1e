use std::collections::VecDeque;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::wire::endpoint::PeerEndpoint;

/// Stable identifier for a client record. Pairing makes two records reference each other,
///  which is naturally cyclic - handles into the table break the cycle, and a reset can read
///  both sides before mutating either.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(u32);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientStatus {
    Free,
    HostWaiting,
    InGame,
    HolePunching,
}

#[derive(Debug)]
pub struct ClientRecord {
    pub endpoint: PeerEndpoint,
    pub status: ClientStatus,
    pub partner: Option<ClientHandle>,
    pub last_message: Instant,
}

/// The server's full view of its clients: the record arena, the endpoint index used to match
///  incoming datagrams, and the FIFO of hosts waiting to be paired.
///
/// Invariants:
/// * `partner` references are symmetric: if `a.partner == Some(b)` then `b.partner == Some(a)`
/// * a record in status [ClientStatus::HostWaiting] appears exactly once in the waiting FIFO;
///    the FIFO may additionally hold tombstones - handles whose record was reset or removed
///    since enqueueing - which are skipped on pop
/// * a [ClientStatus::Free] record has no partner
pub struct ClientTable {
    clients: FxHashMap<ClientHandle, ClientRecord>,
    by_endpoint: FxHashMap<PeerEndpoint, ClientHandle>,
    waiting: VecDeque<ClientHandle>,
    next_handle: u32,
    max_clients: usize,
    max_hosts_waiting: usize,
}

impl ClientTable {
    pub fn new(max_clients: usize, max_hosts_waiting: usize) -> ClientTable {
        ClientTable {
            clients: Default::default(),
            by_endpoint: Default::default(),
            waiting: VecDeque::new(),
            next_handle: 0,
            max_clients,
            max_hosts_waiting,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn lookup(&self, endpoint: PeerEndpoint) -> Option<ClientHandle> {
        self.by_endpoint.get(&endpoint).copied()
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&ClientRecord> {
        self.clients.get(&handle)
    }

    /// Register a previously unknown endpoint. `None` when the table is at capacity.
    pub fn insert(&mut self, endpoint: PeerEndpoint, now: Instant) -> Option<ClientHandle> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let handle = ClientHandle(self.next_handle);
        self.next_handle += 1;

        self.clients.insert(handle, ClientRecord {
            endpoint,
            status: ClientStatus::Free,
            partner: None,
            last_message: now,
        });
        self.by_endpoint.insert(endpoint, handle);
        Some(handle)
    }

    pub fn touch(&mut self, handle: ClientHandle, now: Instant) {
        if let Some(record) = self.clients.get_mut(&handle) {
            record.last_message = now;
        }
    }

    /// Move a client into the waiting FIFO. `false` when the FIFO is at capacity or the
    ///  client is not free.
    pub fn enqueue_waiting(&mut self, handle: ClientHandle) -> bool {
        if self.waiting.len() >= self.max_hosts_waiting {
            return false;
        }
        match self.clients.get_mut(&handle) {
            Some(record) if record.status == ClientStatus::Free => {
                record.status = ClientStatus::HostWaiting;
                // a reset while waiting leaves a tombstone behind; re-hosting must not let
                //  the same handle appear twice
                self.waiting.retain(|&h| h != handle);
                self.waiting.push_back(handle);
                true
            }
            _ => false,
        }
    }

    /// Pop the next waiting host, skipping tombstones - entries whose record was reset or
    ///  removed since it was enqueued.
    pub fn pop_waiting_host(&mut self) -> Option<ClientHandle> {
        while let Some(handle) = self.waiting.pop_front() {
            match self.clients.get(&handle) {
                Some(record) if record.status == ClientStatus::HostWaiting => {
                    return Some(handle);
                }
                _ => {
                    debug!("skipping stale waiting-list entry {:?}", handle);
                }
            }
        }
        None
    }

    /// Pair two clients: mutual partner references, both in game.
    pub fn pair(&mut self, a: ClientHandle, b: ClientHandle) {
        if let Some(record) = self.clients.get_mut(&a) {
            record.partner = Some(b);
            record.status = ClientStatus::InGame;
        }
        if let Some(record) = self.clients.get_mut(&b) {
            record.partner = Some(a);
            record.status = ClientStatus::InGame;
        }
    }

    /// Reset a client to free, detaching and freeing its partner as well. Returns the former
    ///  partner's endpoint so the caller can notify it. A waiting-list entry for the client
    ///  becomes a tombstone.
    pub fn reset(&mut self, handle: ClientHandle) -> Option<PeerEndpoint> {
        let partner = match self.clients.get_mut(&handle) {
            Some(record) => {
                record.status = ClientStatus::Free;
                record.partner.take()
            }
            None => return None,
        };

        let partner = partner?;
        match self.clients.get_mut(&partner) {
            // only detach a partner that still points back; anything else is a stale
            //  reference left over from an earlier reset
            Some(record) if record.partner == Some(handle) => {
                record.status = ClientStatus::Free;
                record.partner = None;
                Some(record.endpoint)
            }
            _ => None,
        }
    }

    /// Delete the record entirely. Returns the record and the endpoint of a partner that
    ///  still pointed back (which is detached and freed).
    pub fn remove(&mut self, handle: ClientHandle) -> Option<(ClientRecord, Option<PeerEndpoint>)> {
        let partner_endpoint = self.reset(handle);
        let record = self.clients.remove(&handle)?;
        self.by_endpoint.remove(&record.endpoint);
        Some((record, partner_endpoint))
    }

    /// All handles whose client has been silent for at least `max_age`.
    pub fn stale_handles(&self, now: Instant, max_age: Duration) -> Vec<ClientHandle> {
        self.clients
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_message) >= max_age)
            .map(|(&handle, _)| handle)
            .collect()
    }

    #[cfg(test)]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (&handle, record) in &self.clients {
            if let Some(partner) = record.partner {
                let partner_record = self.clients.get(&partner).expect("dangling partner handle");
                assert_eq!(partner_record.partner, Some(handle), "partner references must be symmetric");
            }
            if record.status == ClientStatus::Free {
                assert_eq!(record.partner, None, "a free client has no partner");
            }
            if record.status == ClientStatus::HostWaiting {
                assert_eq!(self.waiting.iter().filter(|&&h| h == handle).count(), 1,
                           "a waiting host appears exactly once in the FIFO");
            }
        }
    }
}
