//! Per-session protocol state machine.
//!
//! A [`MixSession`] is one client-side attempt to take part in one
//! multi-party mix with one coordinator: Idle → Queue → AcceptingEntries →
//! Signing, with Error as the catch-all failure state that auto-resets to
//! Idle. Every terminal path releases the session's locked coins and either
//! keeps or returns its reserved keys, never both and never neither.
//!
//! All methods are called with the orchestrator's lock held; the session
//! itself carries no synchronization.

use std::net::SocketAddr;

use rand::Rng;

use crate::config::ClientOptions;
use crate::denom::{
    denomination_of, Denomination, COINJOIN_ENTRY_MAX_SIZE, COINJOIN_QUEUE_TIMEOUT,
    COINJOIN_SIGNING_TIMEOUT,
};
use crate::keys::KeyHolder;
use crate::messages::{
    Accept, Complete, Entry, FinalTransaction, NetMessage, PoolMessage, PoolState,
    PoolStatusUpdate, SignedInputs, StatusMessage, StatusUpdate,
};
use crate::pool::CoordinatorPool;
use crate::registry::Coordinator;
use crate::tx::{Outpoint, Script, Transaction, TxIn, TxOut};
use crate::wallet::{TxDsIn, Wallet};
use crate::{Error, Result};

/// Seconds a queued `dsa` request waits for its connection before giving up.
const PENDING_REQUEST_TIMEOUT: i64 = 15;

/// Seconds a session lingers in Error before resetting to Idle.
const ERROR_RESET_SECS: i64 = 10;

/// Grace added to protocol timeouts so a slow coordinator is not cut off
/// right at the boundary.
const TIMEOUT_LAG_SECS: i64 = 10;

/// An `Accept` held back until the coordinator connection exists.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub address: SocketAddr,
    pub accept: Accept,
    pub created_at: i64,
}

impl PendingRequest {
    fn is_expired(&self, now: i64) -> bool {
        now - self.created_at > PENDING_REQUEST_TIMEOUT
    }
}

pub struct MixSession {
    id: u32,
    state: PoolState,
    /// Coordinator-assigned id; zero until STATUS_ACCEPTED arrives in Queue.
    session_id: i32,
    denomination: Option<Denomination>,
    coordinator: Option<Coordinator>,
    collateral_tx: Transaction,
    pending_request: Option<PendingRequest>,
    locked_outpoints: Vec<Outpoint>,
    key_holder: KeyHolder,
    entries: Vec<Entry>,
    final_tx: Option<Transaction>,
    last_step_time: i64,
    last_message: StatusMessage,
    status: StatusMessage,
}

/// Outcome of a `dsc` completion, reported up for event broadcasting.
#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub id: u32,
    pub denomination: Option<Denomination>,
    pub message: PoolMessage,
}

impl MixSession {
    pub fn new(id: u32) -> MixSession {
        MixSession {
            id,
            state: PoolState::Idle,
            session_id: 0,
            denomination: None,
            coordinator: None,
            collateral_tx: Transaction::new(),
            pending_request: None,
            locked_outpoints: Vec::new(),
            key_holder: KeyHolder::new(),
            entries: Vec::new(),
            final_tx: None,
            last_step_time: 0,
            last_message: StatusMessage::Idle,
            status: StatusMessage::Idle,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn denomination(&self) -> Option<Denomination> {
        self.denomination
    }

    pub fn coordinator(&self) -> Option<Coordinator> {
        self.coordinator
    }

    pub fn status(&self) -> StatusMessage {
        self.status
    }

    pub fn last_message(&self) -> StatusMessage {
        self.last_message
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    pub fn locked_outpoints(&self) -> &[Outpoint] {
        &self.locked_outpoints
    }

    pub fn collateral_tx(&self) -> &Transaction {
        &self.collateral_tx
    }

    pub fn set_collateral_tx(&mut self, tx: Transaction) {
        self.collateral_tx = tx;
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending_request.is_some()
    }

    // ── Resource bookkeeping ────────────────────────────────────────

    /// Lock a coin for this session, mirroring the wallet's lock set so
    /// cleanup releases exactly what was locked.
    pub fn lock_coin(&mut self, wallet: &dyn Wallet, outpoint: Outpoint) {
        wallet.lock_coin(&outpoint);
        self.locked_outpoints.push(outpoint);
    }

    pub fn unlock_coins(&mut self, wallet: &dyn Wallet) {
        for outpoint in &self.locked_outpoints {
            wallet.unlock_coin(outpoint);
        }
        self.locked_outpoints.clear();
    }

    /// Clear all protocol state back to Idle. Does not touch coins or keys;
    /// callers pair this with `unlock_coins` and a key-holder terminal call.
    pub fn reset(&mut self, pool: &CoordinatorPool) {
        if self.coordinator.is_some() {
            pool.release_session(self.id);
        }
        self.state = PoolState::Idle;
        self.session_id = 0;
        self.denomination = None;
        self.coordinator = None;
        self.pending_request = None;
        self.entries.clear();
        self.final_tx = None;
    }

    /// Full failure cleanup: coins unlocked, keys returned, state reset.
    pub fn fail_and_reset(&mut self, wallet: &dyn Wallet, pool: &CoordinatorPool) {
        self.unlock_coins(wallet);
        self.key_holder.return_all(wallet);
        self.reset(pool);
    }

    fn enter_error(&mut self, wallet: &dyn Wallet, message: PoolMessage, now: i64) {
        self.state = PoolState::Error;
        self.unlock_coins(wallet);
        self.key_holder.return_all(wallet);
        self.last_step_time = now;
        self.last_message = StatusMessage::Pool(message);
        self.status = StatusMessage::Incomplete(message);
    }

    // ── Queue entry ─────────────────────────────────────────────────

    /// Idle → Queue: remember the coordinator and queue an `Accept` that is
    /// sent once the connection exists.
    pub fn start_queue(
        &mut self,
        denomination: Denomination,
        coordinator: Coordinator,
        collateral_tx: Transaction,
        now: i64,
    ) {
        debug_assert_eq!(self.state, PoolState::Idle);
        self.denomination = Some(denomination);
        self.coordinator = Some(coordinator);
        self.collateral_tx = collateral_tx.clone();
        self.pending_request = Some(PendingRequest {
            address: coordinator.address,
            accept: Accept {
                denomination: denomination.to_wire(),
                collateral: collateral_tx,
            },
            created_at: now,
        });
        self.state = PoolState::Queue;
        self.last_step_time = now;
        self.status = StatusMessage::TryingToConnect;
        log::info!(
            "session {}: pending connection, denom {} addr {}",
            self.id,
            denomination,
            coordinator.address
        );
    }

    /// Deliver the held `Accept` once connected; drop the session if the
    /// connection never materializes.
    pub fn process_pending_request(
        &mut self,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
        now: i64,
    ) -> bool {
        let Some(request) = self.pending_request.clone() else {
            return false;
        };
        let sent = pool.for_peer(&request.address, |network| {
            network.send(request.address, NetMessage::Accept(request.accept.clone()))
        });
        if sent {
            log::info!("session {}: sent dsa to {}", self.id, request.address);
            self.last_step_time = now;
            self.pending_request = None;
            self.status = StatusMessage::InQueue;
        } else if request.is_expired(now) {
            log::info!(
                "session {}: failed to connect to {}",
                self.id,
                request.address
            );
            self.fail_and_reset(wallet, pool);
        }
        sent
    }

    // ── Entry submission ────────────────────────────────────────────

    /// Pick denominated inputs within the round bracket and pair each with a
    /// freshly reserved output script. With `dry_run` no keys are reserved
    /// and no coins locked; only the pair count matters.
    pub fn prepare_denominate(
        &mut self,
        wallet: &dyn Wallet,
        dsins: &[TxDsIn],
        min_rounds: u32,
        max_rounds: u32,
        dry_run: bool,
    ) -> Result<Vec<(TxDsIn, TxOut)>> {
        let Some(denomination) = self.denomination else {
            return Err(Error::NoCompatibleDenomination);
        };
        let denom_amount = denomination.amount();

        let mut rng = rand::thread_rng();
        let mut steps = 0usize;
        let mut pairs = Vec::new();

        for dsin in dsins {
            if steps >= COINJOIN_ENTRY_MAX_SIZE {
                break;
            }
            if dsin.rounds < min_rounds || dsin.rounds > max_rounds {
                continue;
            }

            let script = if dry_run {
                Script::new()
            } else {
                // Randomly drop some inputs after the first so the entry
                // size is not predictable.
                if steps >= 1 && rng.gen_range(0..5) == 0 {
                    steps += 1;
                    continue;
                }
                self.key_holder.reserve(wallet)?
            };
            pairs.push((dsin.clone(), TxOut::new(denom_amount, script)));
            steps += 1;
        }

        if pairs.is_empty() {
            self.key_holder.return_all(wallet);
            return Err(Error::NoCompatibleDenomination);
        }
        if dry_run {
            return Ok(pairs);
        }

        let outpoints: Vec<Outpoint> = pairs.iter().map(|(dsin, _)| dsin.outpoint).collect();
        for outpoint in outpoints {
            self.lock_coin(wallet, outpoint);
        }
        Ok(pairs)
    }

    /// Wrap prepared (input, output) pairs into an entry and relay it.
    /// AcceptingEntries is entered here.
    pub fn send_denominate(
        &mut self,
        pairs: Vec<(TxDsIn, TxOut)>,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
        now: i64,
    ) -> bool {
        if self.collateral_tx.inputs.is_empty() {
            log::warn!("session {}: collateral not set, cannot submit", self.id);
            return false;
        }
        if self.session_id == 0 {
            log::warn!("session {}: no coordinator session yet", self.id);
            self.fail_and_reset(wallet, pool);
            return false;
        }
        let Some(coordinator) = self.coordinator else {
            return false;
        };

        self.state = PoolState::AcceptingEntries;

        let mut inputs = Vec::with_capacity(pairs.len());
        let mut outputs = Vec::with_capacity(pairs.len());
        for (dsin, txout) in pairs {
            inputs.push(TxIn::from_outpoint(dsin.outpoint));
            outputs.push(txout);
        }
        let entry = Entry {
            inputs,
            outputs,
            collateral: self.collateral_tx.clone(),
        };
        log::info!(
            "session {}: submitting entry with {} inputs",
            self.id,
            entry.inputs.len()
        );
        self.entries.push(entry.clone());
        let relayed = pool.for_peer(&coordinator.address, |network| {
            network.send(coordinator.address, NetMessage::Entry(entry.clone()))
        });
        if relayed {
            self.last_step_time = now;
        }
        relayed
    }

    // ── Message handlers ────────────────────────────────────────────

    fn is_from_coordinator(&self, from: &SocketAddr) -> bool {
        self.coordinator.map(|c| c.address) == Some(*from)
    }

    pub fn process_status_update(
        &mut self,
        from: &SocketAddr,
        update: &StatusUpdate,
        wallet: &dyn Wallet,
        now: i64,
    ) {
        if !self.is_from_coordinator(from) {
            return;
        }
        // No transitions once idle or already failed.
        if self.state == PoolState::Idle || self.state == PoolState::Error {
            return;
        }

        let Some(update_state) = update.pool_state() else {
            log::info!(
                "session {}: status update state {} out of bounds",
                self.id,
                update.state
            );
            return;
        };
        let Some(message) = update.message() else {
            log::info!(
                "session {}: status update message id {} out of bounds",
                self.id,
                update.message_id
            );
            return;
        };

        self.status = StatusMessage::Coordinator(message);

        match update.status() {
            Some(PoolStatusUpdate::Rejected) => {
                log::info!("session {}: rejected by {from}: {message}", self.id);
                self.enter_error(wallet, message, now);
            }
            Some(PoolStatusUpdate::Accepted) => {
                if self.state == update_state
                    && update_state == PoolState::Queue
                    && self.session_id == 0
                    && update.session_id != 0
                {
                    // The coordinator session id may only be assigned here.
                    self.session_id = update.session_id;
                    self.last_step_time = now;
                    log::info!(
                        "session {}: accepted, coordinator session id {}",
                        self.id,
                        update.session_id
                    );
                } else {
                    log::info!("session {}: accepted by coordinator: {message}", self.id);
                }
            }
            None => {
                log::info!(
                    "session {}: status update verdict {} out of bounds",
                    self.id,
                    update.status_update
                );
            }
        }
    }

    pub fn process_final_transaction(
        &mut self,
        from: &SocketAddr,
        message: &FinalTransaction,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
        options: &ClientOptions,
        now: i64,
    ) {
        if !self.is_from_coordinator(from) {
            return;
        }
        if self.session_id != message.session_id {
            log::info!(
                "session {}: dsf for session {} does not match ours {}",
                self.id,
                message.session_id,
                self.session_id
            );
            return;
        }
        self.sign_final_transaction(message.tx.clone(), from, wallet, pool, options, now);
    }

    /// Verify the assembled transaction and push signatures for our inputs.
    ///
    /// Refuses to sign, releasing all resources, whenever the transaction
    /// does not contain exactly our declared inputs and outputs. A cheating
    /// coordinator may then slash our collateral, which is still preferred to
    /// signing a transaction we did not agree to.
    fn sign_final_transaction(
        &mut self,
        final_tx_new: Transaction,
        from: &SocketAddr,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
        options: &ClientOptions,
        now: i64,
    ) -> bool {
        if !options.enabled {
            return false;
        }
        if self.coordinator.is_none() {
            return false;
        }

        // Rebuild a local copy, checking which inputs we can connect to our
        // own transactions.
        let mut final_tx = final_tx_new.clone();
        let our_input_count = final_tx
            .inputs
            .iter()
            .filter(|i| wallet.get_transaction(&i.prev_out.txid).is_some())
            .count();
        log::info!(
            "session {}: final tx with {} inputs ({} ours), {} outputs",
            self.id,
            final_tx.inputs.len(),
            our_input_count,
            final_tx.outputs.len()
        );

        // Canonical ordering check. Some coordinators deliver non-canonical
        // orderings; that alone is not a reason to refuse.
        final_tx.sort_canonical();
        if final_tx.txid() != final_tx_new.txid() {
            log::warn!(
                "session {}: coordinator {from} sent a non-canonical transaction",
                self.id
            );
        }

        if let Err(message) = valid_in_outs(&final_tx, self.denomination) {
            log::warn!("session {}: invalid final transaction: {message}", self.id);
            self.enter_error(wallet, message, now);
            return false;
        }

        // Our declared outputs and inputs must all be present, byte-exact.
        let mut my_indexes: Vec<usize> = Vec::new();
        for entry in &self.entries {
            for txout in &entry.outputs {
                let found = final_tx.outputs.iter().any(|o| {
                    o.value == txout.value
                        && o.script_pubkey.as_bytes() == txout.script_pubkey.as_bytes()
                });
                if !found {
                    log::warn!(
                        "session {}: an output of ours is missing, refusing to sign",
                        self.id
                    );
                    self.enter_error(wallet, PoolMessage::ErrInvalidTx, now);
                    return false;
                }
            }
            for txin in &entry.inputs {
                match final_tx.inputs.iter().position(|i| i.same_outpoint(txin)) {
                    Some(index) => my_indexes.push(index),
                    None => {
                        log::warn!(
                            "session {}: an input of ours is missing, refusing to sign",
                            self.id
                        );
                        self.enter_error(wallet, PoolMessage::ErrInvalidTx, now);
                        return false;
                    }
                }
            }
        }

        if my_indexes.is_empty() {
            log::warn!("session {}: nothing of ours to sign", self.id);
            self.enter_error(wallet, PoolMessage::ErrInvalidTx, now);
            return false;
        }

        let signed = match wallet.sign_inputs(&final_tx, &my_indexes) {
            Ok(signed) if !signed.is_empty() => signed,
            Ok(_) | Err(_) => {
                log::warn!("session {}: can't sign anything", self.id);
                self.enter_error(wallet, PoolMessage::ErrInvalidTx, now);
                return false;
            }
        };

        self.final_tx = Some(final_tx);
        log::info!(
            "session {}: pushing {} signed inputs to {from}",
            self.id,
            signed.len()
        );
        pool.for_peer(from, |network| {
            network.send(
                *from,
                NetMessage::SignedInputs(SignedInputs { inputs: signed }),
            )
        });
        self.state = PoolState::Signing;
        self.last_step_time = now;
        self.status = StatusMessage::SigningStatus;
        true
    }

    pub fn process_complete(
        &mut self,
        from: &SocketAddr,
        message: &Complete,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
    ) -> Option<SessionOutcome> {
        if !self.is_from_coordinator(from) {
            return None;
        }
        let Some(pool_message) = PoolMessage::from_raw(message.message_id) else {
            log::info!(
                "session {}: dsc message id {} out of bounds",
                self.id,
                message.message_id
            );
            return None;
        };
        if self.session_id != message.session_id {
            log::info!(
                "session {}: dsc for session {} does not match ours {}",
                self.id,
                message.session_id,
                self.session_id
            );
            return None;
        }
        log::info!(
            "session {}: completed with {pool_message} ({})",
            self.id,
            message.message_id
        );
        Some(self.completed_transaction(pool_message, wallet, pool))
    }

    fn completed_transaction(
        &mut self,
        message: PoolMessage,
        wallet: &dyn Wallet,
        pool: &CoordinatorPool,
    ) -> SessionOutcome {
        let outcome = SessionOutcome {
            id: self.id,
            denomination: self.denomination,
            message,
        };
        if message == PoolMessage::MsgSuccess {
            log::info!("session {}: mix successful", self.id);
            self.key_holder.keep_all(wallet);
        } else {
            log::info!("session {}: mix failed: {message}", self.id);
            self.key_holder.return_all(wallet);
        }
        self.unlock_coins(wallet);
        self.reset(pool);
        self.last_message = StatusMessage::Pool(message);
        outcome
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Enforce the queue/signing deadlines and the Error auto-reset.
    /// Returns true when a timeout fired.
    pub fn check_timeout(&mut self, wallet: &dyn Wallet, pool: &CoordinatorPool, now: i64) -> bool {
        match self.state {
            PoolState::Idle => return false,
            PoolState::Error => {
                if now - self.last_step_time >= ERROR_RESET_SECS {
                    log::info!("session {}: leaving error state", self.id);
                    self.reset(pool);
                }
                return false;
            }
            _ => {}
        }

        let timeout = if self.state == PoolState::Signing {
            COINJOIN_SIGNING_TIMEOUT
        } else {
            COINJOIN_QUEUE_TIMEOUT
        };
        if now - self.last_step_time < timeout + TIMEOUT_LAG_SECS {
            return false;
        }

        log::info!(
            "session {}: {:?} timed out after {timeout}s",
            self.id,
            self.state
        );
        self.enter_error(wallet, PoolMessage::ErrSession, now);
        true
    }
}

/// Structural checks on the assembled transaction: non-empty and balanced
/// sides, no duplicated inputs, every output an exact denomination matching
/// the session's, sane scripts.
fn valid_in_outs(
    tx: &Transaction,
    session_denom: Option<Denomination>,
) -> std::result::Result<(), PoolMessage> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(PoolMessage::ErrInvalidTx);
    }
    if tx.inputs.len() != tx.outputs.len() {
        return Err(PoolMessage::ErrSizeMismatch);
    }
    for (i, input) in tx.inputs.iter().enumerate() {
        if tx.inputs[..i].iter().any(|other| other.same_outpoint(input)) {
            return Err(PoolMessage::ErrAlreadyHave);
        }
    }
    for output in &tx.outputs {
        if output.script_pubkey.is_empty() {
            return Err(PoolMessage::ErrInvalidScript);
        }
        match denomination_of(output.value) {
            None => return Err(PoolMessage::ErrDenom),
            Some(denom) => {
                if let Some(session_denom) = session_denom {
                    if denom != session_denom {
                        return Err(PoolMessage::ErrDenom);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denom::STANDARD_DENOMINATIONS;
    use crate::tx::txid_from_byte;

    fn denom() -> Denomination {
        Denomination::smallest()
    }

    fn mix_tx(n: usize) -> Transaction {
        let mut tx = Transaction::new();
        for i in 0..n {
            tx.inputs
                .push(TxIn::from_outpoint(Outpoint::new(txid_from_byte(i as u8), 0)));
            tx.outputs.push(TxOut::new(
                denom().amount(),
                Script::p2pkh(&[i as u8; 20]),
            ));
        }
        tx
    }

    #[test]
    fn valid_in_outs_accepts_well_formed_mix() {
        assert!(valid_in_outs(&mix_tx(3), Some(denom())).is_ok());
    }

    #[test]
    fn valid_in_outs_rejects_size_mismatch() {
        let mut tx = mix_tx(3);
        tx.outputs.pop();
        assert_eq!(
            valid_in_outs(&tx, Some(denom())),
            Err(PoolMessage::ErrSizeMismatch)
        );
    }

    #[test]
    fn valid_in_outs_rejects_duplicate_inputs() {
        let mut tx = mix_tx(2);
        tx.inputs[1] = tx.inputs[0].clone();
        assert_eq!(
            valid_in_outs(&tx, Some(denom())),
            Err(PoolMessage::ErrAlreadyHave)
        );
    }

    #[test]
    fn valid_in_outs_rejects_foreign_denomination() {
        let mut tx = mix_tx(2);
        tx.outputs[0].value = STANDARD_DENOMINATIONS[0];
        assert_eq!(
            valid_in_outs(&tx, Some(denom())),
            Err(PoolMessage::ErrDenom)
        );
        tx.outputs[0].value = 12345;
        assert_eq!(
            valid_in_outs(&tx, Some(denom())),
            Err(PoolMessage::ErrDenom)
        );
    }
}
