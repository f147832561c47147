//! Coordinator connection pool.
//!
//! Keeps at most one peer connection per active mixing session, with the
//! connection targets synthesized from the set of pending sessions rather
//! than any general peer list. The pool tracks sessions by their local id
//! only; it never holds a session handle.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::network::Network;
use crate::registry::{Coordinator, CoordinatorRegistry};

pub struct CoordinatorPool {
    network: Arc<dyn Network>,
    registry: Arc<dyn CoordinatorRegistry>,
    session_limit: usize,
    tables: Mutex<PoolTables>,
}

#[derive(Default)]
struct PoolTables {
    /// Local session id → the coordinator that session is mixing with.
    pending: HashMap<u32, Coordinator>,
    /// Peer address → the first session using it (connections are shared).
    by_address: HashMap<SocketAddr, u32>,
    /// Peers queued for closure; dropped from discovery until they die.
    closing: HashSet<SocketAddr>,
    max_connections: usize,
}

impl PoolTables {
    fn update_max(&mut self, session_limit: usize) {
        self.max_connections = self.pending.len().min(session_limit);
    }

    /// Addresses the pool wants connected right now.
    fn targets(&self) -> HashSet<SocketAddr> {
        self.pending
            .values()
            .map(|c| c.address)
            .filter(|a| !self.closing.contains(a))
            .collect()
    }
}

impl CoordinatorPool {
    pub fn new(
        network: Arc<dyn Network>,
        registry: Arc<dyn CoordinatorRegistry>,
        session_limit: usize,
    ) -> CoordinatorPool {
        CoordinatorPool {
            network,
            registry,
            session_limit,
            tables: Mutex::new(PoolTables::default()),
        }
    }

    /// Record that `session_id` intends to mix with `coordinator`, then try
    /// to bring a connection up.
    pub fn add_pending(&self, session_id: u32, coordinator: Coordinator) {
        {
            let mut tables = self.tables.lock().unwrap();
            log::info!(
                "pool: adding coordinator {} for session {session_id}, pending={}",
                coordinator.address,
                tables.pending.len() + 1
            );
            tables.pending.insert(session_id, coordinator);
            tables
                .by_address
                .entry(coordinator.address)
                .or_insert(session_id);
            tables.update_max(self.session_limit);
        }
        self.maintain_connections();
    }

    /// Run `f` against the connected peer at `address`; false if there is no
    /// such peer.
    pub fn for_peer<F>(&self, address: &SocketAddr, f: F) -> bool
    where
        F: FnOnce(&dyn Network) -> bool,
    {
        if self.network.connected_peers().contains(address) {
            f(self.network.as_ref())
        } else {
            log::debug!("pool: {address} is not among connected peers");
            false
        }
    }

    /// Whether we are connected to (or closing) this address.
    pub fn is_coordinator_or_disconnect_requested(&self, address: &SocketAddr) -> bool {
        self.for_peer(address, |_| true)
    }

    /// Queue the peer for closure.
    pub fn disconnect_coordinator(&self, coordinator: &Coordinator) {
        {
            let mut tables = self.tables.lock().unwrap();
            tables.closing.insert(coordinator.address);
        }
        log::info!("pool: closing coordinator {}", coordinator.address);
        self.network.disconnect(coordinator.address);
    }

    /// Drop a session from the tables; disconnects its coordinator unless
    /// another pending session shares the connection.
    pub fn release_session(&self, session_id: u32) {
        let to_close = {
            let mut tables = self.tables.lock().unwrap();
            let coordinator = tables.pending.remove(&session_id);
            tables.update_max(self.session_limit);
            match coordinator {
                Some(c) if !tables.pending.values().any(|o| o.address == c.address) => {
                    tables.by_address.remove(&c.address);
                    tables.closing.insert(c.address);
                    Some(c.address)
                }
                Some(c) => {
                    // Re-point the shared connection at a surviving session.
                    let surviving = tables
                        .pending
                        .iter()
                        .find(|(_, o)| o.address == c.address)
                        .map(|(sid, _)| *sid);
                    if let Some(sid) = surviving {
                        tables.by_address.insert(c.address, sid);
                    }
                    None
                }
                None => None,
            }
        };
        if let Some(address) = to_close {
            log::info!("pool: releasing session {session_id}, closing {address}");
            self.network.disconnect(address);
        }
    }

    /// Peer-death callback from the network layer.
    pub fn on_peer_death(&self, address: &SocketAddr) {
        let mut tables = self.tables.lock().unwrap();
        tables.closing.remove(address);
        if let Some(session_id) = tables.by_address.remove(address) {
            tables.pending.remove(&session_id);
            log::info!("pool: peer {address} died, dropping session {session_id}");
        }
        tables.update_max(self.session_limit);
    }

    /// Reconcile actual connections with the pending set: drop peers no
    /// session needs and open connections for those that lack one. Connects
    /// are refused for addresses the registry does not know.
    pub fn maintain_connections(&self) {
        let (targets, max_connections) = {
            let tables = self.tables.lock().unwrap();
            (tables.targets(), tables.max_connections)
        };
        let connected = self.network.connected_peers();

        for peer in &connected {
            if !targets.contains(peer) {
                log::info!("pool: peer {peer} has no session, disconnecting");
                self.network.disconnect(*peer);
            }
        }

        let mut live = connected.iter().filter(|p| targets.contains(p)).count();
        for address in targets {
            if connected.contains(&address) {
                continue;
            }
            if live >= max_connections {
                break;
            }
            if self.registry.by_address(&address).is_none() {
                log::warn!("pool: {address} not in coordinator registry, refusing to connect");
                continue;
            }
            log::info!("pool: connecting to coordinator {address}");
            if self.network.connect(address) {
                live += 1;
            }
        }
    }

    pub fn max_connections(&self) -> usize {
        self.tables.lock().unwrap().max_connections
    }

    pub fn pending_count(&self) -> usize {
        self.tables.lock().unwrap().pending.len()
    }

    /// Disconnect everything and clear the tables.
    pub fn teardown(&self) {
        let addresses: Vec<SocketAddr> = {
            let mut tables = self.tables.lock().unwrap();
            let addresses = tables.by_address.keys().copied().collect();
            *tables = PoolTables::default();
            addresses
        };
        for address in addresses {
            self.network.disconnect(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_coordinator, ChannelNetwork, StaticRegistry};

    fn pool_with(coordinators: &[Coordinator]) -> (CoordinatorPool, Arc<ChannelNetwork>) {
        let network = Arc::new(ChannelNetwork::new());
        let registry = Arc::new(StaticRegistry::new(coordinators.to_vec()));
        (
            CoordinatorPool::new(network.clone(), registry, 4),
            network,
        )
    }

    #[test]
    fn add_pending_connects_and_dedups() {
        let c = test_coordinator(1);
        let (pool, network) = pool_with(&[c]);
        pool.add_pending(0, c);
        network.complete_pending_connects();
        pool.add_pending(1, c);
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(network.connect_attempts(&c.address), 1);
        assert_eq!(pool.max_connections(), 2);
    }

    #[test]
    fn unknown_coordinator_is_refused() {
        let known = test_coordinator(1);
        let unknown = test_coordinator(2);
        let (pool, network) = pool_with(&[known]);
        pool.add_pending(0, unknown);
        assert_eq!(network.connect_attempts(&unknown.address), 0);
    }

    #[test]
    fn release_last_session_closes_connection() {
        let c = test_coordinator(1);
        let (pool, network) = pool_with(&[c]);
        pool.add_pending(0, c);
        pool.add_pending(1, c);
        network.complete_pending_connects();

        pool.release_session(0);
        assert!(network.connected_peers().contains(&c.address));
        pool.release_session(1);
        assert!(!network.connected_peers().contains(&c.address));
        assert_eq!(pool.max_connections(), 0);
    }

    #[test]
    fn peer_death_drops_session_tables() {
        let c = test_coordinator(1);
        let (pool, network) = pool_with(&[c]);
        pool.add_pending(7, c);
        network.complete_pending_connects();
        network.kill_peer(&c.address);
        pool.on_peer_death(&c.address);
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.max_connections(), 0);
    }

    #[test]
    fn sessionless_peers_are_dropped() {
        let c = test_coordinator(1);
        let (pool, network) = pool_with(&[c]);
        network.force_connect(c.address);
        pool.maintain_connections();
        assert!(!network.connected_peers().contains(&c.address));
    }
}
