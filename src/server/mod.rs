//! The rendezvous and relay server: a single-task UDP endpoint that pairs advertising hosts
//!  with arriving joiners, reveals the peers' endpoints to each other for hole punching, and
//!  forwards payload traffic verbatim between paired clients when the punch fails.

pub mod config;
pub mod client_table;
pub mod rendezvous;
