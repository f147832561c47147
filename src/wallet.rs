//! The wallet seam.
//!
//! Storage, key derivation, the UTXO index, signing primitives and broadcast
//! all live on the other side of this trait; the engine only ever asks for
//! balances, groupings and locks, and hands back transactions to sign.

use std::collections::BTreeSet;

use crate::denom::{Amount, Denomination};
use crate::tx::{Outpoint, Script, Transaction, Txid, TxOut};
use crate::Result;

/// Balance figures the orchestrator bases its decisions on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    /// Outputs that completed the configured number of rounds.
    pub anonymized: Amount,
    /// Confirmed denominated outputs.
    pub denominated_trusted: Amount,
    /// Denominated outputs still waiting for confirmation.
    pub denominated_untrusted_pending: Amount,
}

impl Balance {
    pub fn denominated(&self) -> Amount {
        self.denominated_trusted + self.denominated_untrusted_pending
    }
}

/// One spendable wallet output together with its previous output data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputCoin {
    pub outpoint: Outpoint,
    pub txout: TxOut,
}

/// Wallet outputs grouped by destination address.
#[derive(Debug, Clone)]
pub struct TallyItem {
    pub destination: Script,
    pub amount: Amount,
    pub inputs: Vec<InputCoin>,
}

/// A denominated input candidate, annotated with how many mixing rounds it
/// has already been through.
#[derive(Debug, Clone)]
pub struct TxDsIn {
    pub outpoint: Outpoint,
    pub txout: TxOut,
    pub rounds: u32,
}

/// A receiving script reserved from the wallet's key pool. Must end up either
/// kept (marked used) or returned (back to the pool), exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedKey {
    pub index: u32,
    pub script: Script,
}

pub trait Wallet: Send + Sync {
    fn balance(&self) -> Balance;

    /// Balance that could still be mixed. With `skip_denominated` the figure
    /// excludes already-denominated outputs.
    fn anonymizable_balance(&self, skip_denominated: bool) -> Amount;

    /// Group spendable outputs by destination address.
    fn select_coins_grouped_by_addresses(
        &self,
        skip_denominated: bool,
        anonymizable_only: bool,
        skip_unconfirmed: bool,
        max_inputs: usize,
    ) -> Vec<TallyItem>;

    /// How many wallet outputs carry exactly this amount.
    fn count_inputs_with_amount(&self, amount: Amount) -> usize;

    /// Whether any collateral-sized outputs exist (optionally only confirmed
    /// ones).
    fn has_collateral_inputs(&self, only_confirmed: bool) -> bool;

    /// Collateral-sized outputs available for building a collateral
    /// transaction.
    fn collateral_coins(&self, only_confirmed: bool) -> Vec<InputCoin>;

    /// Select unlocked denominated inputs of the given denomination, shuffled,
    /// up to `max_total` in value. Empty means nothing matched.
    fn select_dsins_by_denomination(
        &self,
        denomination: Denomination,
        max_total: Amount,
    ) -> Vec<TxDsIn>;

    /// The set of denominated amounts available to cover `needs`.
    fn select_denominated_amounts(&self, needs: Amount) -> BTreeSet<Amount>;

    fn is_encrypted(&self) -> bool;

    fn lock_coin(&self, outpoint: &Outpoint);

    fn unlock_coin(&self, outpoint: &Outpoint);

    /// Reserve a fresh receiving script from the key pool.
    fn reserve_key(&self) -> Result<ReservedKey>;

    /// Commit a reserved script as used.
    fn keep_key(&self, key: &ReservedKey);

    /// Release a reserved script back to the pool.
    fn return_key(&self, key: ReservedKey);

    /// Sign every input of `tx` this wallet has keys for.
    fn sign_transaction(&self, tx: &mut Transaction) -> Result<()>;

    /// Sign the inputs of `tx` at `indexes` and return the signed copies.
    fn sign_inputs(&self, tx: &Transaction, indexes: &[usize]) -> Result<Vec<crate::tx::TxIn>>;

    /// Look up one of our own transactions.
    fn get_transaction(&self, txid: &Txid) -> Option<Transaction>;

    /// Register a signed transaction with the wallet and broadcast it.
    fn commit_transaction(&self, tx: Transaction) -> Result<Txid>;
}
