//! Coordinator registry and chain-view seams.
//!
//! The registry owns the coordinator list and the BLS operator keys, so
//! signature verification for `dsq`/`dstx` happens behind it; the engine only
//! supplies the hash that was signed.

use std::net::SocketAddr;

use crate::tx::Outpoint;

/// A coordinator as the engine sees it: its protocol identity and where to
/// reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coordinator {
    pub outpoint: Outpoint,
    pub address: SocketAddr,
}

pub trait CoordinatorRegistry: Send + Sync {
    /// Number of valid coordinators at the current tip.
    fn count(&self) -> usize;

    fn by_outpoint(&self, outpoint: &Outpoint) -> Option<Coordinator>;

    fn by_address(&self, address: &SocketAddr) -> Option<Coordinator>;

    /// A random coordinator not in `used`.
    fn random_not_used(&self, used: &[Outpoint]) -> Option<Coordinator>;

    /// Unix time of the last queue this coordinator opened, 0 if never.
    fn last_dsq(&self, coordinator: &Outpoint) -> i64;

    /// Per-coordinator cooldown threshold: the global dsq count must exceed
    /// this before the coordinator may open another queue.
    fn dsq_threshold(&self, coordinator: &Outpoint) -> i64;

    /// Global count of queues observed.
    fn dsq_count(&self) -> i64;

    /// Record a queue observed from this coordinator (bumps its `last_dsq`
    /// and the global count).
    fn note_dsq(&self, coordinator: &Outpoint, time: i64);

    /// Verify a queue advertisement signature against the coordinator's
    /// operator key.
    fn verify_queue_signature(
        &self,
        coordinator: &Outpoint,
        hash: &[u8; 32],
        signature: &[u8],
    ) -> bool;

    /// Verify a broadcast-transaction signature against the coordinator's
    /// operator key.
    fn verify_broadcast_signature(
        &self,
        coordinator: &Outpoint,
        hash: &[u8; 32],
        signature: &[u8],
    ) -> bool;
}

/// Read-only view of chain sync state.
pub trait ChainView: Send + Sync {
    fn is_synced(&self) -> bool;

    fn tip_height(&self) -> u32;
}
