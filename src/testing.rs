//! In-memory fixtures for the wallet, registry, chain and network seams.
//!
//! Promoted from the integration tests so downstream harnesses can drive the
//! full engine without a node: a [`MemoryWallet`] with grouping and locking,
//! a [`StaticRegistry`] with deterministic signature checks, a [`StubChain`]
//! and a [`ChannelNetwork`] that records every sent message.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::denom::{is_collateral_amount, is_denominated_amount, Amount, Denomination};
use crate::messages::{NetMessage, Queue};
use crate::network::Network;
use crate::registry::{ChainView, Coordinator, CoordinatorRegistry};
use crate::tx::{double_sha256, Outpoint, Script, Transaction, Txid, TxIn, TxOut};
use crate::wallet::{Balance, InputCoin, ReservedKey, TallyItem, TxDsIn, Wallet};
use crate::{Error, Result};

// ── MemoryWallet ────────────────────────────────────────────────────

#[derive(Clone)]
struct CoinRecord {
    outpoint: Outpoint,
    txout: TxOut,
    confirmations: u32,
    /// Mixing rounds completed; `Some` only for denominated coins.
    rounds: Option<u32>,
    address_id: u32,
    spent: bool,
}

#[derive(Default)]
struct WalletInner {
    coins: Vec<CoinRecord>,
    txs: HashMap<Txid, Transaction>,
    locked: HashSet<Outpoint>,
    scripts: HashMap<Vec<u8>, u32>,
    next_key: u32,
    next_funding: u8,
    reserved: HashSet<u32>,
    kept_reserved: HashSet<u32>,
    encrypted: bool,
    required_rounds: u32,
}

/// A fully in-memory wallet good enough to drive every engine path.
pub struct MemoryWallet {
    inner: Mutex<WalletInner>,
}

impl Default for MemoryWallet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWallet {
    pub fn new() -> MemoryWallet {
        MemoryWallet {
            inner: Mutex::new(WalletInner {
                required_rounds: 4,
                ..WalletInner::default()
            }),
        }
    }

    fn script_for_key(index: u32) -> Script {
        let digest = double_sha256(&index.to_le_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest[..20]);
        Script::p2pkh(&hash)
    }

    fn new_key(inner: &mut WalletInner) -> (u32, Script) {
        let index = inner.next_key;
        inner.next_key += 1;
        let script = Self::script_for_key(index);
        inner.scripts.insert(script.as_bytes().to_vec(), index);
        (index, script)
    }

    fn is_anonymized(inner: &WalletInner, coin: &CoinRecord) -> bool {
        matches!(coin.rounds, Some(r) if r >= inner.required_rounds)
    }

    fn spendable<'a>(inner: &'a WalletInner) -> impl Iterator<Item = &'a CoinRecord> {
        inner
            .coins
            .iter()
            .filter(move |c| !c.spent && !inner.locked.contains(&c.outpoint))
    }

    /// Register a coinbase-like funding transaction paying `amounts` to one
    /// fresh address, and return its tally item.
    pub fn fund_address(&self, amounts: &[Amount], confirmations: u32) -> TallyItem {
        let mut inner = self.inner.lock().unwrap();
        let (address_id, script) = Self::new_key(&mut inner);

        let mut tx = Transaction::new();
        // Distinct fake previous output so every funding txid is unique.
        let marker = inner.next_funding;
        inner.next_funding = inner.next_funding.wrapping_add(1);
        tx.inputs.push(TxIn::from_outpoint(Outpoint::new(
            Txid([marker; 32]),
            u32::MAX,
        )));
        for &amount in amounts {
            tx.outputs.push(TxOut::new(amount, script.clone()));
        }
        let txid = tx.txid();
        inner.txs.insert(txid, tx);

        let mut inputs = Vec::new();
        for (index, &amount) in amounts.iter().enumerate() {
            let outpoint = Outpoint::new(txid, index as u32);
            let txout = TxOut::new(amount, script.clone());
            inner.coins.push(CoinRecord {
                outpoint,
                txout: txout.clone(),
                confirmations,
                rounds: is_denominated_amount(amount).then_some(0),
                address_id,
                spent: false,
            });
            inputs.push(InputCoin { outpoint, txout });
        }
        TallyItem {
            destination: script,
            amount: amounts.iter().sum(),
            inputs,
        }
    }

    /// Fund `count` denominated coins, one address each, at the given rounds.
    pub fn fund_denominated(
        &self,
        denomination: Denomination,
        count: usize,
        rounds: u32,
    ) -> Vec<Outpoint> {
        let mut outpoints = Vec::new();
        for _ in 0..count {
            let tally = self.fund_address(&[denomination.amount()], 10);
            let outpoint = tally.inputs[0].outpoint;
            let mut inner = self.inner.lock().unwrap();
            if let Some(coin) = inner.coins.iter_mut().find(|c| c.outpoint == outpoint) {
                coin.rounds = Some(rounds);
            }
            outpoints.push(outpoint);
        }
        outpoints
    }

    /// Fund `count` confirmed collateral-sized coins.
    pub fn fund_collateral(&self, count: usize, value: Amount) -> Vec<Outpoint> {
        assert!(is_collateral_amount(value));
        (0..count)
            .map(|_| self.fund_address(&[value], 10).inputs[0].outpoint)
            .collect()
    }

    /// Mark every coin as deeply confirmed.
    pub fn confirm_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for coin in &mut inner.coins {
            coin.confirmations = coin.confirmations.max(6);
        }
    }

    pub fn set_encrypted(&self, encrypted: bool) {
        self.inner.lock().unwrap().encrypted = encrypted;
    }

    pub fn set_required_rounds(&self, rounds: u32) {
        self.inner.lock().unwrap().required_rounds = rounds;
    }

    pub fn locked_count(&self) -> usize {
        self.inner.lock().unwrap().locked.len()
    }

    pub fn is_locked(&self, outpoint: &Outpoint) -> bool {
        self.inner.lock().unwrap().locked.contains(outpoint)
    }

    pub fn reserved_key_count(&self) -> usize {
        self.inner.lock().unwrap().reserved.len()
    }

    /// Keys that went through the reserve path and were then kept.
    pub fn kept_key_count(&self) -> usize {
        self.inner.lock().unwrap().kept_reserved.len()
    }
}

impl Wallet for MemoryWallet {
    fn balance(&self) -> Balance {
        let inner = self.inner.lock().unwrap();
        let mut balance = Balance::default();
        for coin in inner.coins.iter().filter(|c| !c.spent) {
            if coin.rounds.is_some() {
                if coin.confirmations > 0 {
                    balance.denominated_trusted += coin.txout.value;
                } else {
                    balance.denominated_untrusted_pending += coin.txout.value;
                }
                if Self::is_anonymized(&inner, coin) {
                    balance.anonymized += coin.txout.value;
                }
            }
        }
        balance
    }

    fn anonymizable_balance(&self, skip_denominated: bool) -> Amount {
        let inner = self.inner.lock().unwrap();
        Self::spendable(&inner)
            .filter(|c| c.confirmations > 0)
            .filter(|c| !Self::is_anonymized(&inner, c))
            .filter(|c| !skip_denominated || c.rounds.is_none())
            .map(|c| c.txout.value)
            .sum()
    }

    fn select_coins_grouped_by_addresses(
        &self,
        skip_denominated: bool,
        anonymizable_only: bool,
        skip_unconfirmed: bool,
        max_inputs: usize,
    ) -> Vec<TallyItem> {
        let inner = self.inner.lock().unwrap();
        let mut groups: HashMap<u32, TallyItem> = HashMap::new();
        for coin in Self::spendable(&inner) {
            if skip_denominated && coin.rounds.is_some() {
                continue;
            }
            if anonymizable_only && Self::is_anonymized(&inner, coin) {
                continue;
            }
            if skip_unconfirmed && coin.confirmations == 0 {
                continue;
            }
            let item = groups.entry(coin.address_id).or_insert_with(|| TallyItem {
                destination: coin.txout.script_pubkey.clone(),
                amount: 0,
                inputs: Vec::new(),
            });
            if item.inputs.len() >= max_inputs {
                continue;
            }
            item.amount += coin.txout.value;
            item.inputs.push(InputCoin {
                outpoint: coin.outpoint,
                txout: coin.txout.clone(),
            });
        }
        groups.into_values().filter(|t| !t.inputs.is_empty()).collect()
    }

    fn count_inputs_with_amount(&self, amount: Amount) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .coins
            .iter()
            .filter(|c| !c.spent && c.txout.value == amount)
            .count()
    }

    fn has_collateral_inputs(&self, only_confirmed: bool) -> bool {
        !self.collateral_coins(only_confirmed).is_empty()
    }

    fn collateral_coins(&self, only_confirmed: bool) -> Vec<InputCoin> {
        let inner = self.inner.lock().unwrap();
        Self::spendable(&inner)
            .filter(|c| is_collateral_amount(c.txout.value))
            .filter(|c| !only_confirmed || c.confirmations > 0)
            .map(|c| InputCoin {
                outpoint: c.outpoint,
                txout: c.txout.clone(),
            })
            .collect()
    }

    fn select_dsins_by_denomination(
        &self,
        denomination: Denomination,
        max_total: Amount,
    ) -> Vec<TxDsIn> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<TxDsIn> = Self::spendable(&inner)
            .filter(|c| c.txout.value == denomination.amount())
            .filter_map(|c| {
                c.rounds.map(|rounds| TxDsIn {
                    outpoint: c.outpoint,
                    txout: c.txout.clone(),
                    rounds,
                })
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut total = 0;
        let mut selected = Vec::new();
        for candidate in candidates {
            if total + candidate.txout.value > max_total {
                continue;
            }
            total += candidate.txout.value;
            selected.push(candidate);
        }
        selected
    }

    fn select_denominated_amounts(&self, needs: Amount) -> BTreeSet<Amount> {
        let inner = self.inner.lock().unwrap();
        let mut amounts = BTreeSet::new();
        let mut total = 0;
        for coin in Self::spendable(&inner).filter(|c| c.rounds.is_some()) {
            if Self::is_anonymized(&inner, coin) {
                continue;
            }
            amounts.insert(coin.txout.value);
            total += coin.txout.value;
            if total >= needs {
                break;
            }
        }
        amounts
    }

    fn is_encrypted(&self) -> bool {
        self.inner.lock().unwrap().encrypted
    }

    fn lock_coin(&self, outpoint: &Outpoint) {
        self.inner.lock().unwrap().locked.insert(*outpoint);
    }

    fn unlock_coin(&self, outpoint: &Outpoint) {
        self.inner.lock().unwrap().locked.remove(outpoint);
    }

    fn reserve_key(&self) -> Result<ReservedKey> {
        let mut inner = self.inner.lock().unwrap();
        let (index, script) = Self::new_key(&mut inner);
        inner.reserved.insert(index);
        Ok(ReservedKey { index, script })
    }

    fn keep_key(&self, key: &ReservedKey) {
        let mut inner = self.inner.lock().unwrap();
        if inner.reserved.remove(&key.index) {
            inner.kept_reserved.insert(key.index);
        }
    }

    fn return_key(&self, key: ReservedKey) {
        self.inner.lock().unwrap().reserved.remove(&key.index);
    }

    fn sign_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        for input in &mut tx.inputs {
            if !inner.txs.contains_key(&input.prev_out.txid) {
                return Err(Error::Signing(format!(
                    "unknown previous transaction {}",
                    input.prev_out.txid
                )));
            }
            input.script_sig = Script::from_bytes(vec![0x47, 0x51]);
        }
        Ok(())
    }

    fn sign_inputs(&self, tx: &Transaction, indexes: &[usize]) -> Result<Vec<TxIn>> {
        let inner = self.inner.lock().unwrap();
        let mut signed = Vec::new();
        for &index in indexes {
            let Some(input) = tx.inputs.get(index) else {
                return Err(Error::Signing(format!("input index {index} out of range")));
            };
            if !inner.txs.contains_key(&input.prev_out.txid) {
                return Err(Error::Signing("not our input".to_string()));
            }
            let mut input = input.clone();
            input.script_sig = Script::from_bytes(vec![0x47, 0x51]);
            signed.push(input);
        }
        Ok(signed)
    }

    fn get_transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.inner.lock().unwrap().txs.get(txid).cloned()
    }

    fn commit_transaction(&self, tx: Transaction) -> Result<Txid> {
        let mut inner = self.inner.lock().unwrap();
        let txid = tx.txid();

        for input in &tx.inputs {
            inner.locked.remove(&input.prev_out);
            if let Some(coin) = inner
                .coins
                .iter_mut()
                .find(|c| c.outpoint == input.prev_out)
            {
                coin.spent = true;
            }
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(&address_id) = inner.scripts.get(output.script_pubkey.as_bytes()) else {
                continue;
            };
            inner.coins.push(CoinRecord {
                outpoint: Outpoint::new(txid, index as u32),
                txout: output.clone(),
                confirmations: 0,
                rounds: is_denominated_amount(output.value).then_some(0),
                address_id,
                spent: false,
            });
        }
        inner.txs.insert(txid, tx);
        Ok(txid)
    }
}

// ── StaticRegistry ──────────────────────────────────────────────────

#[derive(Default)]
struct RegistryCounters {
    last_dsq: HashMap<Outpoint, i64>,
    dsq_threshold: HashMap<Outpoint, i64>,
    dsq_count: i64,
}

/// Fixed coordinator list with deterministic "BLS" checks: a signature is
/// valid iff it equals [`test_signature`] for the same coordinator and hash.
pub struct StaticRegistry {
    coordinators: Vec<Coordinator>,
    counters: Mutex<RegistryCounters>,
}

impl StaticRegistry {
    pub fn new(coordinators: Vec<Coordinator>) -> StaticRegistry {
        StaticRegistry {
            coordinators,
            counters: Mutex::new(RegistryCounters::default()),
        }
    }

    pub fn set_last_dsq(&self, coordinator: &Outpoint, time: i64) {
        self.counters
            .lock()
            .unwrap()
            .last_dsq
            .insert(*coordinator, time);
    }

    pub fn set_dsq_threshold(&self, coordinator: &Outpoint, threshold: i64) {
        self.counters
            .lock()
            .unwrap()
            .dsq_threshold
            .insert(*coordinator, threshold);
    }
}

impl CoordinatorRegistry for StaticRegistry {
    fn count(&self) -> usize {
        self.coordinators.len()
    }

    fn by_outpoint(&self, outpoint: &Outpoint) -> Option<Coordinator> {
        self.coordinators
            .iter()
            .find(|c| c.outpoint == *outpoint)
            .copied()
    }

    fn by_address(&self, address: &SocketAddr) -> Option<Coordinator> {
        self.coordinators
            .iter()
            .find(|c| c.address == *address)
            .copied()
    }

    fn random_not_used(&self, used: &[Outpoint]) -> Option<Coordinator> {
        let unused: Vec<&Coordinator> = self
            .coordinators
            .iter()
            .filter(|c| !used.contains(&c.outpoint))
            .collect();
        if unused.is_empty() {
            return None;
        }
        Some(*unused[rand::thread_rng().gen_range(0..unused.len())])
    }

    fn last_dsq(&self, coordinator: &Outpoint) -> i64 {
        *self
            .counters
            .lock()
            .unwrap()
            .last_dsq
            .get(coordinator)
            .unwrap_or(&0)
    }

    fn dsq_threshold(&self, coordinator: &Outpoint) -> i64 {
        *self
            .counters
            .lock()
            .unwrap()
            .dsq_threshold
            .get(coordinator)
            .unwrap_or(&0)
    }

    fn dsq_count(&self) -> i64 {
        self.counters.lock().unwrap().dsq_count
    }

    fn note_dsq(&self, coordinator: &Outpoint, time: i64) {
        let mut counters = self.counters.lock().unwrap();
        counters.last_dsq.insert(*coordinator, time);
        counters.dsq_count += 1;
    }

    fn verify_queue_signature(
        &self,
        coordinator: &Outpoint,
        hash: &[u8; 32],
        signature: &[u8],
    ) -> bool {
        signature == test_signature(coordinator, hash).as_slice()
    }

    fn verify_broadcast_signature(
        &self,
        coordinator: &Outpoint,
        hash: &[u8; 32],
        signature: &[u8],
    ) -> bool {
        signature == test_signature(coordinator, hash).as_slice()
    }
}

// ── StubChain ───────────────────────────────────────────────────────

pub struct StubChain {
    synced: AtomicBool,
    height: AtomicU32,
}

impl StubChain {
    pub fn synced_at(height: u32) -> StubChain {
        StubChain {
            synced: AtomicBool::new(true),
            height: AtomicU32::new(height),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn advance(&self) {
        self.height.fetch_add(1, Ordering::SeqCst);
    }
}

impl ChainView for StubChain {
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn tip_height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }
}

// ── ChannelNetwork ──────────────────────────────────────────────────

#[derive(Default)]
struct NetworkInner {
    connected: HashSet<SocketAddr>,
    pending_connects: Vec<SocketAddr>,
    connect_attempts: HashMap<SocketAddr, usize>,
    sent: Vec<(SocketAddr, NetMessage)>,
}

/// Records connection attempts and sent messages; connections complete only
/// when the test says so, mirroring the asynchronous connect of a real
/// peer-to-peer layer.
#[derive(Default)]
pub struct ChannelNetwork {
    inner: Mutex<NetworkInner>,
}

impl ChannelNetwork {
    pub fn new() -> ChannelNetwork {
        ChannelNetwork::default()
    }

    /// Promote every pending connect into a live connection.
    pub fn complete_pending_connects(&self) {
        let mut inner = self.inner.lock().unwrap();
        let pending = std::mem::take(&mut inner.pending_connects);
        inner.connected.extend(pending);
    }

    /// Connect without going through the pool (a peer nobody asked for).
    pub fn force_connect(&self, address: SocketAddr) {
        self.inner.lock().unwrap().connected.insert(address);
    }

    pub fn kill_peer(&self, address: &SocketAddr) {
        self.inner.lock().unwrap().connected.remove(address);
    }

    pub fn connect_attempts(&self, address: &SocketAddr) -> usize {
        *self
            .inner
            .lock()
            .unwrap()
            .connect_attempts
            .get(address)
            .unwrap_or(&0)
    }

    /// Everything sent so far, in order.
    pub fn sent_messages(&self) -> Vec<(SocketAddr, NetMessage)> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Messages with the given wire command, regardless of recipient.
    pub fn sent_with_command(&self, command: &str) -> Vec<NetMessage> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(_, m)| m.command() == command)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Network for ChannelNetwork {
    fn connect(&self, address: SocketAddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        *inner.connect_attempts.entry(address).or_insert(0) += 1;
        if !inner.connected.contains(&address) && !inner.pending_connects.contains(&address) {
            inner.pending_connects.push(address);
        }
        true
    }

    fn disconnect(&self, address: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected.remove(&address);
        inner.pending_connects.retain(|a| a != &address);
    }

    fn send(&self, address: SocketAddr, message: NetMessage) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected.contains(&address) {
            return false;
        }
        inner.sent.push((address, message));
        true
    }

    fn connected_peers(&self) -> Vec<SocketAddr> {
        self.inner.lock().unwrap().connected.iter().copied().collect()
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Deterministic stand-in for a BLS signature, bound to the coordinator and
/// the signed hash.
pub fn test_signature(coordinator: &Outpoint, hash: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(hash);
    data.extend_from_slice(coordinator.txid.as_bytes());
    data.extend_from_slice(&coordinator.index.to_le_bytes());
    let digest = double_sha256(&data);
    let mut signature = Vec::with_capacity(96);
    for _ in 0..3 {
        signature.extend_from_slice(&digest);
    }
    signature
}

/// A coordinator with a recognizable outpoint and loopback address.
pub fn test_coordinator(n: u8) -> Coordinator {
    Coordinator {
        outpoint: Outpoint::new(Txid([0xc0 ^ n; 32]), 0),
        address: SocketAddr::from(([127, 0, 0, n], 19_000 + n as u16)),
    }
}

/// A correctly signed queue advertisement at the smallest denomination.
pub fn signed_queue(coordinator: &Coordinator, time: i64, ready: bool) -> Queue {
    signed_queue_denom(coordinator, Denomination::smallest(), time, ready)
}

/// A correctly signed queue advertisement at a chosen denomination.
pub fn signed_queue_denom(
    coordinator: &Coordinator,
    denomination: Denomination,
    time: i64,
    ready: bool,
) -> Queue {
    let mut queue = Queue {
        denomination: denomination.to_wire(),
        coordinator_outpoint: coordinator.outpoint,
        time,
        ready,
        signature: Vec::new(),
    };
    queue.signature = test_signature(&coordinator.outpoint, &queue.signature_hash());
    queue
}
