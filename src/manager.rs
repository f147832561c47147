//! Process-wide mixing manager.
//!
//! Owns one [`Orchestrator`] per wallet, the shared coordinator pool and
//! queue listener, and the 1 Hz maintenance thread that drives them all.
//! Incoming protocol messages from the network layer enter through
//! [`MixManager::process_message`]; peer deaths through
//! [`MixManager::on_peer_death`].
//!
//! The maintenance tick runs on a dedicated thread with a shutdown channel;
//! [`MixManager::stop`] cancels it, resets every session and tears down the
//! pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::ClientOptions;
use crate::messages::{BroadcastTx, NetMessage};
use crate::network::Network;
use crate::orchestrator::Orchestrator;
use crate::pool::CoordinatorPool;
use crate::queue::QueueListener;
use crate::registry::{ChainView, CoordinatorRegistry};
use crate::tx::Txid;
use crate::wallet::Wallet;

/// Current unix time in seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct ManagerShared {
    registry: Arc<dyn CoordinatorRegistry>,
    pool: Arc<CoordinatorPool>,
    queue: Arc<QueueListener>,
    orchestrators: Mutex<HashMap<String, Arc<Orchestrator>>>,
    /// Mixing transactions published by coordinators, keyed by txid.
    broadcast_txs: Mutex<HashMap<Txid, BroadcastTx>>,
}

impl ManagerShared {
    fn orchestrator_list(&self) -> Vec<Arc<Orchestrator>> {
        self.orchestrators.lock().unwrap().values().cloned().collect()
    }

    fn do_maintenance(&self, now: i64) {
        self.queue.do_maintenance(now);
        for orchestrator in self.orchestrator_list() {
            orchestrator.do_maintenance(now);
        }
    }
}

struct TickHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

pub struct MixManager {
    chain: Arc<dyn ChainView>,
    shared: Arc<ManagerShared>,
    tick: Option<TickHandle>,
}

impl MixManager {
    pub fn new(
        registry: Arc<dyn CoordinatorRegistry>,
        chain: Arc<dyn ChainView>,
        network: Arc<dyn Network>,
        session_limit: usize,
    ) -> MixManager {
        let pool = Arc::new(CoordinatorPool::new(network, registry.clone(), session_limit));
        let queue = Arc::new(QueueListener::new(registry.clone()));
        MixManager {
            chain,
            shared: Arc::new(ManagerShared {
                registry,
                pool,
                queue,
                orchestrators: Mutex::new(HashMap::new()),
                broadcast_txs: Mutex::new(HashMap::new()),
            }),
            tick: None,
        }
    }

    /// Create (or replace) the orchestrator for a wallet.
    pub fn register_wallet(
        &self,
        wallet_id: impl Into<String>,
        wallet: Arc<dyn Wallet>,
        options: ClientOptions,
    ) -> Arc<Orchestrator> {
        let wallet_id = wallet_id.into();
        let orchestrator = Arc::new(Orchestrator::new(
            wallet_id.clone(),
            wallet,
            self.shared.registry.clone(),
            self.chain.clone(),
            options,
            self.shared.pool.clone(),
            self.shared.queue.clone(),
        ));
        self.shared
            .orchestrators
            .lock()
            .unwrap()
            .insert(wallet_id, orchestrator.clone());
        orchestrator
    }

    pub fn orchestrator(&self, wallet_id: &str) -> Option<Arc<Orchestrator>> {
        self.shared.orchestrators.lock().unwrap().get(wallet_id).cloned()
    }

    pub fn pool(&self) -> &Arc<CoordinatorPool> {
        &self.shared.pool
    }

    pub fn queue_listener(&self) -> &Arc<QueueListener> {
        &self.shared.queue
    }

    // ── Message intake ──────────────────────────────────────────────

    /// Entry point for the network layer's delivery threads.
    pub fn process_message(&self, from: SocketAddr, message: NetMessage, now: i64) {
        match message {
            NetMessage::Queue(queue) => {
                let outpoint = queue.coordinator_outpoint;
                match self.shared.queue.process_queue(queue, now) {
                    Ok(true) => {
                        // A ready queue wakes up any session waiting on that
                        // coordinator.
                        for orchestrator in self.shared.orchestrator_list() {
                            orchestrator.process_queue_ready(&outpoint, now);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => log::debug!("manager: dsq from {from} dropped: {e}"),
                }
            }
            NetMessage::BroadcastTx(dstx) => self.process_broadcast_tx(from, dstx),
            other => {
                for orchestrator in self.shared.orchestrator_list() {
                    orchestrator.process_message(&from, &other, now);
                }
            }
        }
    }

    /// Verify and remember a coordinator-published mixing transaction.
    fn process_broadcast_tx(&self, from: SocketAddr, dstx: BroadcastTx) {
        if self
            .shared
            .registry
            .by_outpoint(&dstx.coordinator_outpoint)
            .is_none()
        {
            log::debug!("manager: dstx from {from} with unknown coordinator");
            return;
        }
        if !self.shared.registry.verify_broadcast_signature(
            &dstx.coordinator_outpoint,
            &dstx.signature_hash(),
            &dstx.signature,
        ) {
            log::warn!("manager: dstx from {from} with invalid signature");
            return;
        }
        let txid = dstx.tx.txid();
        let mut txs = self.shared.broadcast_txs.lock().unwrap();
        if txs.insert(txid, dstx).is_none() {
            log::info!("manager: observed mixing transaction {txid}");
        }
    }

    pub fn has_broadcast_tx(&self, txid: &Txid) -> bool {
        self.shared.broadcast_txs.lock().unwrap().contains_key(txid)
    }

    /// Peer-death callback from the network layer.
    pub fn on_peer_death(&self, address: &SocketAddr) {
        self.shared.pool.on_peer_death(address);
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Run one maintenance pass now (exposed for tests and embedders with
    /// their own schedulers).
    pub fn do_maintenance(&self, now: i64) {
        self.shared.do_maintenance(now);
    }

    /// Start the 1 Hz maintenance thread.
    pub fn start(&mut self) {
        if self.tick.is_some() {
            return;
        }
        let (shutdown, rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let thread = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::info!("manager: maintenance thread stopping");
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    shared.do_maintenance(unix_time());
                }
            }
        });
        self.tick = Some(TickHandle { shutdown, thread });
        log::info!("manager: maintenance thread started");
    }

    pub fn is_running(&self) -> bool {
        self.tick.is_some()
    }

    /// Cancel the tick, reset every session and tear down the pool.
    pub fn stop(&mut self) {
        if let Some(tick) = self.tick.take() {
            let _ = tick.shutdown.send(());
            let _ = tick.thread.join();
        }
        for orchestrator in self.shared.orchestrator_list() {
            orchestrator.reset_pool();
        }
        self.shared.pool.teardown();
    }
}

impl Drop for MixManager {
    fn drop(&mut self) {
        self.stop();
    }
}
