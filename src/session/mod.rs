//! The client-side session engine: server handshake, role establishment, hole-punch
//!  negotiation, and the steady-state reliability loop layered over the raw UDP link.
//!
//! A [connection::Session] is created per call to [connection::Session::start_host] or
//!  [connection::Session::connect_to_host] and lives until closed; it owns the UDP socket
//!  and the background engine task exclusively. The application communicates through the
//!  outbound word buffer, the inbound word mailbox, and the lifecycle event channel.

pub mod config;
pub mod events;
pub mod send_state;
pub mod recv_state;
pub mod sync_state;
pub mod connection;

pub(crate) mod shared;
pub(crate) mod handshake;
