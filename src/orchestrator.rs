//! Per-wallet mixing orchestrator.
//!
//! Drives automatic mixing: balance accounting, denomination and collateral
//! creation, coordinator selection (joining advertised queues or opening new
//! ones), entry preparation and submission. Owns every [`MixSession`] of its
//! wallet behind a single mutex; incoming protocol messages and the
//! maintenance tick both go through it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tokio::sync::broadcast;

use crate::config::ClientOptions;
use crate::denom::{
    denomination_of, fmt_amount, max_collateral_amount, max_pool_amount, min_collateral_amount,
    smallest_denomination, Amount, Denomination, STANDARD_DENOMINATIONS,
};
use crate::messages::{NetMessage, PoolMessage, PoolState, PoolStatus, StatusMessage};
use crate::planner;
use crate::pool::CoordinatorPool;
use crate::queue::QueueListener;
use crate::registry::{ChainView, CoordinatorRegistry};
use crate::session::MixSession;
use crate::tx::{Outpoint, Script, Transaction, TxIn, TxOut};
use crate::wallet::Wallet;
use crate::{Error, Result};

/// Events observers (the progress tracker, UIs) can subscribe to.
#[derive(Debug, Clone)]
pub enum MixEvent {
    SessionStarted {
        id: u32,
        denomination: Denomination,
    },
    SessionComplete {
        id: u32,
        denomination: Option<Denomination>,
        message: PoolMessage,
    },
    MixingComplete {
        statuses: Vec<PoolStatus>,
    },
}

struct OrchestratorState {
    sessions: Vec<MixSession>,
    next_session_id: u32,
    used_coordinators: Vec<Outpoint>,
    last_success_height: Option<u32>,
    statuses: Vec<PoolStatus>,
    mixing_complete_sent: bool,
    last_result: StatusMessage,
}

pub struct Orchestrator {
    wallet_id: String,
    wallet: Arc<dyn Wallet>,
    registry: Arc<dyn CoordinatorRegistry>,
    chain: Arc<dyn ChainView>,
    options: ClientOptions,
    pool: Arc<CoordinatorPool>,
    queue: Arc<QueueListener>,
    state: Mutex<OrchestratorState>,
    events: broadcast::Sender<MixEvent>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet_id: impl Into<String>,
        wallet: Arc<dyn Wallet>,
        registry: Arc<dyn CoordinatorRegistry>,
        chain: Arc<dyn ChainView>,
        options: ClientOptions,
        pool: Arc<CoordinatorPool>,
        queue: Arc<QueueListener>,
    ) -> Orchestrator {
        let (events, _) = broadcast::channel(64);
        Orchestrator {
            wallet_id: wallet_id.into(),
            wallet,
            registry,
            chain,
            options,
            pool,
            queue,
            state: Mutex::new(OrchestratorState {
                sessions: Vec::new(),
                next_session_id: 0,
                used_coordinators: Vec::new(),
                last_success_height: None,
                statuses: Vec::new(),
                mixing_complete_sent: false,
                last_result: StatusMessage::Idle,
            }),
            events,
        }
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MixEvent> {
        self.events.subscribe()
    }

    /// The most recent auto-denominating result, rendered for display.
    pub fn status(&self) -> String {
        self.state.lock().unwrap().last_result.to_string()
    }

    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap()
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// One 1 Hz tick: deliver held requests, enforce timeouts, then attempt
    /// automatic denominating for idle sessions.
    pub fn do_maintenance(&self, now: i64) {
        if !self.options.enabled {
            return;
        }
        {
            let mut st = self.lock_state();
            let wallet = self.wallet.as_ref();
            for session in &mut st.sessions {
                session.process_pending_request(wallet, &self.pool, now);
                if session.check_timeout(wallet, &self.pool, now) {
                    let _ = self.events.send(MixEvent::SessionComplete {
                        id: session.id(),
                        denomination: session.denomination(),
                        message: PoolMessage::ErrSession,
                    });
                }
            }
        }
        self.do_automatic_denominating(now);
        self.pool.maintain_connections();
    }

    // ── Automatic denominating ──────────────────────────────────────

    /// Passively run mixing according to the configured options. Returns
    /// true when any forward progress was made this tick.
    pub fn do_automatic_denominating(&self, now: i64) -> bool {
        if !self.options.enabled {
            return false;
        }
        if !self.chain.is_synced() {
            self.set_result(StatusMessage::NotSynced);
            return false;
        }
        if self.wallet.is_encrypted() {
            self.set_result(StatusMessage::WalletLocked);
            return false;
        }

        let Ok(mut st) = self.state.try_lock() else {
            log::debug!("orchestrator[{}]: lock is already in place", self.wallet_id);
            return false;
        };

        if self.registry.count() == 0 {
            st.last_result = StatusMessage::NoCoordinators;
            log::info!("orchestrator[{}]: no coordinators detected", self.wallet_id);
            return false;
        }

        // Throttle: one successful action per chain tip.
        if st.last_success_height == Some(self.chain.tip_height()) {
            st.last_result = StatusMessage::LastActionTooRecent;
            return false;
        }

        let balance = self.wallet.balance();
        let mut balance_needs_anonymized = self
            .options
            .amount
            .saturating_sub(balance.anonymized);
        if balance_needs_anonymized == 0 {
            log::info!("orchestrator[{}]: nothing to do", self.wallet_id);
            st.last_result = StatusMessage::NothingToDo;
            self.finish_mixing(&mut st);
            return false;
        }

        let mut value_min = smallest_denomination();
        // No confirmed collaterals yet: budget for creating them too.
        if !self.wallet.has_collateral_inputs(true) {
            value_min += max_collateral_amount();
        }

        let balance_anonymizable = self.wallet.anonymizable_balance(false);
        if balance_anonymizable < value_min {
            st.last_result = StatusMessage::NotEnoughFunds;
            log::info!("orchestrator[{}]: not enough funds to mix", self.wallet_id);
            return false;
        }

        let balance_non_denom = self.wallet.anonymizable_balance(true);
        let balance_denominated = balance.denominated();
        let balance_to_denominate = self.options.amount.saturating_sub(balance_denominated);

        // When the leftover target is smaller than the smallest denomination
        // and a spare denomination can cover the overshoot, round the target
        // up so the final mix can finish on an exact denomination.
        if balance_denominated.saturating_sub(balance.anonymized) > balance_needs_anonymized {
            let mut additional = 0;
            for &denom_value in STANDARD_DENOMINATIONS.iter() {
                if balance_needs_anonymized < denom_value {
                    additional = denom_value;
                } else {
                    break;
                }
            }
            balance_needs_anonymized += additional;
        }

        log::debug!(
            "orchestrator[{}]: needs {}, anonymizable {}, non-denom {}, denominated {}, to denominate {}",
            self.wallet_id,
            fmt_amount(balance_needs_anonymized),
            fmt_amount(balance_anonymizable),
            fmt_amount(balance_non_denom),
            fmt_amount(balance_denominated),
            fmt_amount(balance_to_denominate),
        );

        // Create more denominated outputs when there are funds for it and the
        // denominated balance has not reached the target yet.
        if balance_non_denom >= value_min + min_collateral_amount() && balance_to_denominate > 0 {
            match planner::create_denominated(
                self.wallet.as_ref(),
                &self.options,
                balance_to_denominate,
            ) {
                Ok(txid) => {
                    log::info!(
                        "orchestrator[{}]: created denominations in {txid}",
                        self.wallet_id
                    );
                    st.last_success_height = Some(self.chain.tip_height());
                }
                Err(e) => log::info!(
                    "orchestrator[{}]: create_denominated: {e}",
                    self.wallet_id
                ),
            }
        }

        // Make sure collateral-sized inputs exist before any session starts.
        if !self.wallet.has_collateral_inputs(true) {
            if self.wallet.has_collateral_inputs(false) {
                // Unconfirmed ones exist; wait for them.
                return false;
            }
            let made = match planner::make_collateral_amounts(self.wallet.as_ref(), &self.options)
            {
                Ok(txid) => {
                    log::info!(
                        "orchestrator[{}]: created collaterals in {txid}",
                        self.wallet_id
                    );
                    st.last_success_height = Some(self.chain.tip_height());
                    true
                }
                Err(e) => {
                    log::info!(
                        "orchestrator[{}]: make_collateral_amounts: {e}",
                        self.wallet_id
                    );
                    false
                }
            };
            return made;
        }

        // Once every coordinator has been used, forget the history so mixing
        // can keep going.
        if st.used_coordinators.len() >= self.registry.count() {
            st.used_coordinators.clear();
        }

        // Grow the session list up to the configured bound.
        while st.sessions.len() < self.options.session_limit() {
            let id = st.next_session_id;
            st.next_session_id += 1;
            st.sessions.push(MixSession::new(id));
        }

        let mut any_started = false;
        for index in 0..st.sessions.len() {
            if st.sessions[index].state() != PoolState::Idle {
                st.last_result = StatusMessage::MixingInProgress;
                continue;
            }
            if self.session_attempt(&mut st, index, balance_needs_anonymized, now) {
                let session = &st.sessions[index];
                if let Some(denomination) = session.denomination() {
                    let _ = self.events.send(MixEvent::SessionStarted {
                        id: session.id(),
                        denomination,
                    });
                }
                any_started = true;
            }
        }
        any_started
    }

    /// Steps 8-12 for one idle session: clean leftovers, refresh collateral,
    /// then join an advertised queue or open a new one.
    fn session_attempt(
        &self,
        st: &mut OrchestratorState,
        index: usize,
        balance_needs_anonymized: Amount,
        now: i64,
    ) -> bool {
        let wallet = self.wallet.as_ref();
        let balance = self.wallet.balance();

        // Clean anything left over from the previous run of this session.
        st.sessions[index].fail_and_reset(wallet, &self.pool);

        // In single-session mode unconfirmed denominations block new attempts.
        if !self.options.multi_session && balance.denominated_untrusted_pending > 0 {
            st.last_result = StatusMessage::UnconfirmedDenoms;
            log::info!(
                "orchestrator[{}]: waiting for unconfirmed denominations",
                self.wallet_id
            );
            return false;
        }

        // Create or revalidate the session collateral and lock its inputs.
        let collateral_ok = {
            let session = &mut st.sessions[index];
            if session.collateral_tx().is_empty()
                || !is_collateral_valid(wallet, session.collateral_tx())
            {
                match self.create_collateral_transaction() {
                    Ok(tx) => {
                        session.set_collateral_tx(tx);
                        true
                    }
                    Err(e) => {
                        log::info!(
                            "orchestrator[{}]: create collateral error: {e}",
                            self.wallet_id
                        );
                        false
                    }
                }
            } else {
                true
            }
        };
        if !collateral_ok {
            return false;
        }
        let collateral_inputs: Vec<Outpoint> = st.sessions[index]
            .collateral_tx()
            .inputs
            .iter()
            .map(|i| i.prev_out)
            .collect();
        for outpoint in collateral_inputs {
            st.sessions[index].lock_coin(wallet, outpoint);
        }

        let OrchestratorState {
            sessions,
            used_coordinators,
            last_result,
            ..
        } = st;
        let session = &mut sessions[index];

        if self.join_existing_queue(
            session,
            used_coordinators,
            last_result,
            balance_needs_anonymized,
            now,
        ) {
            return true;
        }
        if self.start_new_queue(
            session,
            used_coordinators,
            last_result,
            balance_needs_anonymized,
            now,
        ) {
            return true;
        }

        // Neither worked; release the collateral lock again.
        session.fail_and_reset(wallet, &self.pool);
        *last_result = StatusMessage::NoCompatibleCoordinator;
        false
    }

    // ── Queue joining ───────────────────────────────────────────────

    /// Scan advertised queues for one whose denomination we can serve.
    fn join_existing_queue(
        &self,
        session: &mut MixSession,
        used_coordinators: &mut Vec<Outpoint>,
        last_result: &mut StatusMessage,
        balance_needs_anonymized: Amount,
        now: i64,
    ) -> bool {
        while let Some(queue) = self.queue.next_ready(now) {
            let Some(coordinator) = self.registry.by_outpoint(&queue.coordinator_outpoint) else {
                log::info!(
                    "orchestrator[{}]: queue coordinator {} not in registry",
                    self.wallet_id,
                    queue.coordinator_outpoint
                );
                continue;
            };
            let Some(denomination) = Denomination::from_wire(queue.denomination) else {
                log::info!(
                    "orchestrator[{}]: queue denomination {} invalid",
                    self.wallet_id,
                    queue.denomination
                );
                continue;
            };

            // Match their denomination against our inputs before connecting.
            let matching = self
                .wallet
                .select_dsins_by_denomination(denomination, balance_needs_anonymized);
            if matching.is_empty() {
                log::info!(
                    "orchestrator[{}]: couldn't match denomination {denomination}",
                    self.wallet_id
                );
                continue;
            }

            used_coordinators.push(coordinator.outpoint);

            if self
                .pool
                .is_coordinator_or_disconnect_requested(&coordinator.address)
            {
                log::info!(
                    "orchestrator[{}]: coordinator {} already in use, skipping",
                    self.wallet_id,
                    coordinator.address
                );
                continue;
            }

            log::info!(
                "orchestrator[{}]: joining existing queue {queue}",
                self.wallet_id
            );
            let collateral = session.collateral_tx().clone();
            session.start_queue(denomination, coordinator, collateral, now);
            self.pool.add_pending(session.id(), coordinator);
            *last_result = StatusMessage::TryingToConnect;
            return true;
        }
        *last_result = StatusMessage::NoQueueToJoin;
        false
    }

    /// Pick a coordinator at random (respecting cooldowns) and open a new
    /// queue at one of our available denominations.
    fn start_new_queue(
        &self,
        session: &mut MixSession,
        used_coordinators: &mut Vec<Outpoint>,
        last_result: &mut StatusMessage,
        balance_needs_anonymized: Amount,
        now: i64,
    ) -> bool {
        if balance_needs_anonymized == 0 {
            return false;
        }

        // Amounts we could actually serve; the denomination pick below
        // requires this to be non-empty.
        let amounts: Vec<Amount> = self
            .wallet
            .select_denominated_amounts(balance_needs_anonymized)
            .into_iter()
            .filter(|&a| denomination_of(a).is_some())
            .collect();
        if amounts.is_empty() {
            *last_result = StatusMessage::NoCompatibleInputs;
            log::info!("orchestrator[{}]: no compatible inputs", self.wallet_id);
            return false;
        }

        let mut rng = rand::thread_rng();
        let mut tries = 0;
        while tries < 10 {
            let Some(coordinator) = self.registry.random_not_used(used_coordinators) else {
                *last_result = StatusMessage::NoRandomCoordinator;
                log::info!("orchestrator[{}]: no unused coordinator", self.wallet_id);
                return false;
            };
            used_coordinators.push(coordinator.outpoint);

            let last_dsq = self.registry.last_dsq(&coordinator.outpoint);
            let dsq_threshold = self.registry.dsq_threshold(&coordinator.outpoint);
            let dsq_count = self.registry.dsq_count();
            if last_dsq != 0 && dsq_threshold > dsq_count {
                log::info!(
                    "orchestrator[{}]: too early to mix on {}: last_dsq={last_dsq} threshold={dsq_threshold} count={dsq_count}",
                    self.wallet_id,
                    coordinator.address
                );
                tries += 1;
                continue;
            }
            if self
                .pool
                .is_coordinator_or_disconnect_requested(&coordinator.address)
            {
                log::info!(
                    "orchestrator[{}]: skipping busy coordinator {}",
                    self.wallet_id,
                    coordinator.address
                );
                tries += 1;
                continue;
            }

            log::info!(
                "orchestrator[{}]: attempt {tries}, connecting to {}",
                self.wallet_id,
                coordinator.address
            );

            // One random denomination out of the serveable set, biased away
            // from always picking the first entry.
            let denomination = 'pick: loop {
                for &amount in &amounts {
                    if amounts.len() > 1 && rng.gen_range(0..2) != 0 {
                        continue;
                    }
                    if let Some(denomination) = denomination_of(amount) {
                        break 'pick denomination;
                    }
                }
            };

            let collateral = session.collateral_tx().clone();
            session.start_queue(denomination, coordinator, collateral, now);
            self.pool.add_pending(session.id(), coordinator);
            *last_result = StatusMessage::TryingToConnect;
            return true;
        }
        *last_result = StatusMessage::FailedToStartQueue;
        false
    }

    // ── Entry preparation ───────────────────────────────────────────

    /// Submit our part of the mix once the coordinator's queue is ready:
    /// probe which round bracket matches the most inputs, prepare that set
    /// for real, and relay the entry.
    pub fn submit_denominate(&self, session_index: usize, now: i64) -> bool {
        let mut st = self.lock_state();
        let wallet = self.wallet.as_ref();

        if wallet.is_encrypted() {
            st.last_result = StatusMessage::WalletLocked;
            return false;
        }
        let session = &mut st.sessions[session_index];
        if session.entries_count() > 0 {
            st.last_result = StatusMessage::PendingEntries;
            return false;
        }
        let Some(denomination) = session.denomination() else {
            st.last_result = StatusMessage::InvalidSessionDenom;
            return false;
        };

        let dsins = wallet.select_dsins_by_denomination(denomination, max_pool_amount());
        if dsins.is_empty() {
            st.last_result = StatusMessage::CantSelectInputs;
            log::info!("orchestrator[{}]: can't select inputs", self.wallet_id);
            return false;
        }

        // Dry-run each round bracket to see how many inputs it would match.
        let mut inputs_by_rounds: Vec<(u32, usize)> = Vec::new();
        for rounds in 0..(self.options.rounds + self.options.random_rounds) {
            match session.prepare_denominate(wallet, &dsins, rounds, rounds, true) {
                Ok(pairs) => {
                    log::debug!(
                        "orchestrator[{}]: dry run for {rounds} rounds: {} inputs",
                        self.wallet_id,
                        pairs.len()
                    );
                    inputs_by_rounds.push((rounds, pairs.len()));
                }
                Err(e) => log::debug!(
                    "orchestrator[{}]: dry run for {rounds} rounds: {e}",
                    self.wallet_id
                ),
            }
        }

        // More inputs first; for equal input counts prefer fewer rounds.
        inputs_by_rounds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        if let Some(&(rounds, _)) = inputs_by_rounds.first() {
            if let Ok(pairs) = session.prepare_denominate(wallet, &dsins, rounds, rounds, false) {
                log::info!(
                    "orchestrator[{}]: denominating {} inputs at {rounds} rounds",
                    self.wallet_id,
                    pairs.len()
                );
                return session.send_denominate(pairs, wallet, &self.pool, now);
            }
        }

        // Final attempt: mix anything within the configured rounds.
        match session.prepare_denominate(
            wallet,
            &dsins,
            0,
            self.options.rounds.saturating_sub(1),
            false,
        ) {
            Ok(pairs) => {
                log::info!(
                    "orchestrator[{}]: denominating {} inputs at any rounds",
                    self.wallet_id,
                    pairs.len()
                );
                session.send_denominate(pairs, wallet, &self.pool, now)
            }
            Err(e) => {
                log::info!("orchestrator[{}]: submit failed: {e}", self.wallet_id);
                st.last_result = StatusMessage::CantPrepareOutputs;
                false
            }
        }
    }

    // ── Collateral transaction ──────────────────────────────────────

    /// Build and sign the anti-DoS collateral transaction from a random
    /// collateral-sized coin.
    fn create_collateral_transaction(&self) -> Result<Transaction> {
        let wallet = self.wallet.as_ref();
        let coins = wallet.collateral_coins(true);
        if coins.is_empty() {
            return Err(Error::NoCollateralInputs);
        }
        let coin = &coins[rand::thread_rng().gen_range(0..coins.len())];

        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::from_outpoint(coin.outpoint));

        if coin.txout.value >= min_collateral_amount() * 2 {
            // Pay the collateral charge in fees and return the change to a
            // fresh address, kept right away.
            let key = wallet.reserve_key()?;
            let script = key.script.clone();
            wallet.keep_key(&key);
            tx.outputs.push(TxOut::new(
                coin.txout.value - min_collateral_amount(),
                script,
            ));
        } else {
            // Burn the whole coin as the fee behind a data output.
            tx.outputs.push(TxOut::new(0, Script::op_return()));
        }

        wallet.sign_transaction(&mut tx)?;
        Ok(tx)
    }

    // ── Message handling ────────────────────────────────────────────

    /// Dispatch a coordinator-originated message to the matching session.
    pub fn process_message(&self, from: &SocketAddr, message: &NetMessage, now: i64) {
        let mut st = self.lock_state();
        let wallet = self.wallet.as_ref();
        match message {
            NetMessage::StatusUpdate(update) => {
                for session in &mut st.sessions {
                    session.process_status_update(from, update, wallet, now);
                }
            }
            NetMessage::FinalTransaction(final_tx) => {
                for session in &mut st.sessions {
                    session.process_final_transaction(
                        from,
                        final_tx,
                        wallet,
                        &self.pool,
                        &self.options,
                        now,
                    );
                }
            }
            NetMessage::Complete(complete) => {
                let mut outcomes = Vec::new();
                for session in &mut st.sessions {
                    if let Some(outcome) =
                        session.process_complete(from, complete, wallet, &self.pool)
                    {
                        outcomes.push(outcome);
                    }
                }
                for outcome in outcomes {
                    if outcome.message == PoolMessage::MsgSuccess {
                        st.last_success_height = Some(self.chain.tip_height());
                    }
                    let _ = self.events.send(MixEvent::SessionComplete {
                        id: outcome.id,
                        denomination: outcome.denomination,
                        message: outcome.message,
                    });
                }
            }
            _ => {}
        }
    }

    /// A ready queue from a coordinator we are waiting on means it is time
    /// to submit our entry.
    pub fn process_queue_ready(&self, coordinator_outpoint: &Outpoint, now: i64) {
        let index = {
            let st = self.lock_state();
            st.sessions.iter().position(|s| {
                s.state() == PoolState::Queue
                    && s.session_id() != 0
                    && s.coordinator().map(|c| c.outpoint) == Some(*coordinator_outpoint)
            })
        };
        if let Some(index) = index {
            log::info!(
                "orchestrator[{}]: queue ready for session {index}, submitting",
                self.wallet_id
            );
            self.submit_denominate(index, now);
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Reset every session, releasing coins, keys and connections.
    pub fn reset_pool(&self) {
        let mut st = self.lock_state();
        let wallet = self.wallet.as_ref();
        for session in &mut st.sessions {
            session.fail_and_reset(wallet, &self.pool);
        }
    }

    fn set_result(&self, result: StatusMessage) {
        self.state.lock().unwrap().last_result = result;
    }

    /// Record the finished state and notify observers exactly once.
    fn finish_mixing(&self, st: &mut OrchestratorState) {
        if !st.statuses.contains(&PoolStatus::Finished) {
            st.statuses.push(PoolStatus::Finished);
        }
        if !st.mixing_complete_sent {
            st.mixing_complete_sent = true;
            let _ = self.events.send(MixEvent::MixingComplete {
                statuses: st.statuses.clone(),
            });
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn session_states(&self) -> Vec<(u32, PoolState, i32)> {
        self.lock_state()
            .sessions
            .iter()
            .map(|s| (s.id(), s.state(), s.session_id()))
            .collect()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn locked_outpoint_count(&self) -> usize {
        self.lock_state()
            .sessions
            .iter()
            .map(|s| s.locked_outpoints().len())
            .sum()
    }
}

// ── Free helpers ────────────────────────────────────────────────────

/// Structural validity of a client collateral transaction: inputs we know,
/// no overdraft, and a fee worth at least the minimum collateral charge.
pub(crate) fn is_collateral_valid(wallet: &dyn Wallet, tx: &Transaction) -> bool {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return false;
    }
    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        let Some(prev) = wallet.get_transaction(&input.prev_out.txid) else {
            return false;
        };
        let Some(prev_out) = prev.outputs.get(input.prev_out.index as usize) else {
            return false;
        };
        value_in += prev_out.value;
    }
    let value_out: Amount = tx.outputs.iter().map(|o| o.value).sum();
    if value_out > value_in {
        return false;
    }
    value_in - value_out >= min_collateral_amount()
}
