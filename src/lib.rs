//! A rendezvous-and-relay service plus a reliable UDP session library that together let two
//!  game clients establish a low-latency bidirectional message stream across the public
//!  Internet.
//!
//! The [server] half is a single-task UDP endpoint on a well-known port that pairs an
//!  advertising host with the next arriving joiner, reveals each peer's externally observed
//!  endpoint so the two can attempt UDP hole-punching, and falls back to relaying every
//!  payload datagram when the punch fails.
//!
//! The [session] half runs inside each client process: it performs the server handshake and
//!  role establishment, attempts the peer-to-peer punch, and then layers a lightweight
//!  reliability protocol over the raw UDP link - monotonic per-sender sequence numbers,
//!  missing-id tracking with NAK-carrying check beacons, retransmission from a retained send
//!  list, keepalive, round-trip estimation and application state-hash comparison for
//!  detecting desynchronisation.
//!
//! Delivery guarantees are deliberately modest: application words arrive at least once and
//!  without duplicates, but datagrams are not ordered against each other. Clients that need
//!  strict ordering must embed sequencing in their payload.

pub mod wire;
pub mod server;
pub mod session;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
