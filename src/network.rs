//! The network seam.
//!
//! Connection establishment, framing and transport all belong to the host's
//! peer-to-peer layer. The engine only needs to open and close connections by
//! socket address, send decoded messages, and see who is connected. Incoming
//! messages arrive as calls into [`MixManager::process_message`].
//!
//! [`MixManager::process_message`]: crate::manager::MixManager::process_message

use std::net::SocketAddr;

use crate::messages::NetMessage;

pub trait Network: Send + Sync {
    /// Request a connection; completion is observed via `connected_peers`.
    fn connect(&self, address: SocketAddr) -> bool;

    fn disconnect(&self, address: SocketAddr);

    /// Send to a connected peer. Returns false if no such peer.
    fn send(&self, address: SocketAddr, message: NetMessage) -> bool;

    fn connected_peers(&self) -> Vec<SocketAddr>;
}
