//! Incremental transaction builder used by the planners.
//!
//! Wraps a fixed input set (one tally item) and grows a list of planned
//! outputs while keeping a conservative fee reservation, so `amount_left`
//! never goes negative. Each planned output reserves a fresh destination
//! script; reservations are kept on commit and returned if the builder is
//! dropped without committing.

use std::fmt;

use crate::denom::Amount;
use crate::tx::{Transaction, TxIn, TxOut};
use crate::wallet::{ReservedKey, TallyItem, Wallet};
use crate::{Error, Result};

/// Serialized size assumed per input (p2pkh spend).
const BYTES_PER_INPUT: u64 = 148;
/// Serialized size assumed per output.
const BYTES_PER_OUTPUT: u64 = 34;
/// Version, locktime, counts.
const TX_OVERHEAD_BYTES: u64 = 10;
/// Flat fee rate in duffs per kilobyte.
const FEE_RATE_PER_KB: u64 = 1000;
/// Outputs below this are uneconomical to spend.
pub const DUST_THRESHOLD: Amount = 546;

/// Handle to one planned output; stays valid for the builder's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputHandle(usize);

struct BuilderOutput {
    amount: Amount,
    key: ReservedKey,
}

pub struct TransactionBuilder<'a> {
    wallet: &'a dyn Wallet,
    tally: TallyItem,
    outputs: Vec<BuilderOutput>,
    committed: bool,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(wallet: &'a dyn Wallet, tally: TallyItem) -> TransactionBuilder<'a> {
        TransactionBuilder {
            wallet,
            tally,
            outputs: Vec::new(),
            committed: false,
        }
    }

    fn fee_for(&self, output_count: usize) -> Amount {
        let bytes = TX_OVERHEAD_BYTES
            + BYTES_PER_INPUT * self.tally.inputs.len() as u64
            + BYTES_PER_OUTPUT * output_count as u64;
        (bytes * FEE_RATE_PER_KB).div_ceil(1000)
    }

    fn outputs_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Input total minus planned outputs minus the current fee reservation.
    pub fn amount_left(&self) -> Amount {
        self.tally
            .amount
            .saturating_sub(self.outputs_total())
            .saturating_sub(self.fee_for(self.outputs.len()))
    }

    pub fn count_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Whether one more output of `amount` would still leave `amount_left`
    /// non-negative after the fee reservation grows.
    pub fn could_add_output(&self, amount: Amount) -> bool {
        self.tally.amount
            >= self
                .outputs_total()
                .saturating_add(amount)
                .saturating_add(self.fee_for(self.outputs.len() + 1))
    }

    /// Same check for a batch of outputs at once.
    pub fn could_add_outputs(&self, amounts: &[Amount]) -> bool {
        let batch: Amount = amounts.iter().sum();
        self.tally.amount
            >= self
                .outputs_total()
                .saturating_add(batch)
                .saturating_add(self.fee_for(self.outputs.len() + amounts.len()))
    }

    /// Plan an output of `amount` to a freshly reserved script. `None` if it
    /// does not fit or the key pool is exhausted.
    pub fn add_output(&mut self, amount: Amount) -> Option<OutputHandle> {
        if !self.could_add_output(amount) {
            return None;
        }
        let key = self.wallet.reserve_key().ok()?;
        self.outputs.push(BuilderOutput { amount, key });
        Some(OutputHandle(self.outputs.len() - 1))
    }

    /// Plan a zero-amount placeholder, to be filled in with `update_amount`
    /// once the surrounding outputs are known.
    pub fn add_placeholder(&mut self) -> Option<OutputHandle> {
        self.add_output(0)
    }

    /// Change a planned output's amount; rejected if the new amount would
    /// overdraw the inputs.
    pub fn update_amount(&mut self, handle: OutputHandle, amount: Amount) -> bool {
        let old = self.outputs[handle.0].amount;
        let fits = self.tally.amount
            >= self.outputs_total() - old + amount + self.fee_for(self.outputs.len());
        if fits {
            self.outputs[handle.0].amount = amount;
        }
        fits
    }

    pub fn output_amount(&self, handle: OutputHandle) -> Amount {
        self.outputs[handle.0].amount
    }

    pub fn is_dust(&self, amount: Amount) -> bool {
        amount < DUST_THRESHOLD
    }

    /// Finalize: build the transaction, have the wallet sign it, and commit
    /// it (register + broadcast). Reserved destinations are kept.
    pub fn commit(&mut self) -> Result<crate::tx::Txid> {
        if self.outputs.is_empty() {
            return Err(Error::EmptyPlan);
        }
        let mut tx = Transaction::new();
        tx.inputs = self
            .tally
            .inputs
            .iter()
            .map(|coin| TxIn::from_outpoint(coin.outpoint))
            .collect();
        tx.outputs = self
            .outputs
            .iter()
            .map(|o| TxOut::new(o.amount, o.key.script.clone()))
            .collect();

        self.wallet.sign_transaction(&mut tx)?;
        let txid = self.wallet.commit_transaction(tx)?;

        for output in &self.outputs {
            self.wallet.keep_key(&output.key);
        }
        self.committed = true;
        log::info!("builder: committed {txid} ({self})");
        Ok(txid)
    }
}

impl Drop for TransactionBuilder<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for output in std::mem::take(&mut self.outputs) {
                self.wallet.return_key(output.key);
            }
        }
    }
}

impl fmt::Display for TransactionBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TxBuilder(inputs={}/{} duffs, outputs={}/{} duffs, left={} duffs)",
            self.tally.inputs.len(),
            self.tally.amount,
            self.outputs.len(),
            self.outputs_total(),
            self.amount_left()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryWallet;

    fn tally_of(wallet: &MemoryWallet, amount: Amount) -> TallyItem {
        wallet.fund_address(&[amount], 10)
    }

    #[test]
    fn could_add_output_is_exact() {
        let wallet = MemoryWallet::new();
        let tally = tally_of(&wallet, 100_000);
        let builder = TransactionBuilder::new(&wallet, tally);
        // One input, one planned output: 10 + 148 + 34 = 192 bytes of fee.
        assert!(builder.could_add_output(100_000 - 192));
        assert!(!builder.could_add_output(100_000 - 191));
    }

    #[test]
    fn amount_left_tracks_outputs_and_fee() {
        let wallet = MemoryWallet::new();
        let tally = tally_of(&wallet, 100_000);
        let mut builder = TransactionBuilder::new(&wallet, tally);
        assert_eq!(builder.amount_left(), 100_000 - 158);
        builder.add_output(40_000).unwrap();
        assert_eq!(builder.amount_left(), 100_000 - 40_000 - 192);
    }

    #[test]
    fn placeholder_update_consumes_remainder() {
        let wallet = MemoryWallet::new();
        let tally = tally_of(&wallet, 100_000);
        let mut builder = TransactionBuilder::new(&wallet, tally);
        let handle = builder.add_placeholder().unwrap();
        let left = builder.amount_left();
        assert!(builder.update_amount(handle, left));
        assert_eq!(builder.amount_left(), 0);
        assert!(!builder.update_amount(handle, left + 1));
        assert_eq!(builder.output_amount(handle), left);
    }

    #[test]
    fn commit_requires_outputs_and_keeps_keys() {
        let wallet = MemoryWallet::new();
        let tally = tally_of(&wallet, 100_000);
        let mut builder = TransactionBuilder::new(&wallet, tally);
        assert!(matches!(builder.commit(), Err(Error::EmptyPlan)));
        builder.add_output(50_000).unwrap();
        let txid = builder.commit().unwrap();
        drop(builder);
        assert_eq!(wallet.reserved_key_count(), 0);
        assert_eq!(wallet.kept_key_count(), 1);
        assert!(wallet.get_transaction(&txid).is_some());
    }

    #[test]
    fn dropping_uncommitted_builder_returns_keys() {
        let wallet = MemoryWallet::new();
        let tally = tally_of(&wallet, 100_000);
        {
            let mut builder = TransactionBuilder::new(&wallet, tally);
            builder.add_output(10_000).unwrap();
            builder.add_output(10_000).unwrap();
            assert_eq!(wallet.reserved_key_count(), 2);
        }
        assert_eq!(wallet.reserved_key_count(), 0);
        assert_eq!(wallet.kept_key_count(), 0);
    }
}
