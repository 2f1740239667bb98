//! Transport management for the collective layer.
//!
//! [`connect_to_peers`] opens the outbound connection set a leaf
//! strategy addresses its collectives over; [`ServerManager`] owns the
//! inbound side.

mod network;
mod server;

pub use network::{close_connections, connect_to_peers, PeerConnections};
pub use server::ServerManager;
