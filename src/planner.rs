//! Output planning for the two housekeeping transactions mixing needs:
//! denomination creation and collateral creation.
//!
//! Both planners consume one tally item at a time through the
//! [`TransactionBuilder`] and commit the first plan that works out.

use std::collections::BTreeMap;

use crate::builder::TransactionBuilder;
use crate::config::ClientOptions;
use crate::denom::{
    fmt_amount, is_denominated_amount, is_collateral_amount, max_collateral_amount,
    min_collateral_amount, smallest_denomination, Amount, COINJOIN_DENOM_OUTPUTS_THRESHOLD,
    STANDARD_DENOMINATIONS,
};
use crate::tx::Txid;
use crate::wallet::{TallyItem, Wallet};
use crate::{Error, Result};

/// Upper bound on inputs consumed per plan. Keeps the transaction well under
/// the standardness size limit while still sweeping many small outputs.
const MAX_PLAN_INPUTS: usize = 400;

// ── Denomination creation ───────────────────────────────────────────

/// Create denominated outputs worth up to `balance_to_denominate`, trying
/// tally items largest-first and committing the first workable plan.
pub fn create_denominated(
    wallet: &dyn Wallet,
    options: &ClientOptions,
    balance_to_denominate: Amount,
) -> Result<Txid> {
    if !options.enabled {
        return Err(Error::Disabled);
    }

    let mut tallies =
        wallet.select_coins_grouped_by_addresses(true, true, true, MAX_PLAN_INPUTS);
    if tallies.is_empty() {
        log::info!("planner: grouped selection found no inputs to denominate");
        return Err(Error::NoInputs);
    }

    // Largest balances first: bigger groups yield the larger denominations.
    tallies.sort_by(|a, b| b.amount.cmp(&a.amount));

    let create_collateral = !wallet.has_collateral_inputs(true);

    let mut last_error = Error::PlanFailed("no tally item produced a plan");
    for tally in tallies {
        match create_denominated_from(wallet, options, balance_to_denominate, tally, create_collateral)
        {
            Ok(txid) => return Ok(txid),
            Err(e) => {
                log::debug!("planner: tally rejected: {e}");
                last_error = e;
            }
        }
    }
    log::info!("planner: create_denominated failed: {last_error}");
    Err(last_error)
}

/// Shared loop state for one denomination-creation plan.
struct DenomPlan {
    balance_left: i64,
    /// The one chance to place a single output smaller than the remaining
    /// balance, so small remainders still get denominated.
    add_final: bool,
    denom_counts: BTreeMap<Amount, usize>,
}

impl DenomPlan {
    /// Whether one more `denom_value` output should be added given the
    /// remaining balance. Consumes the final-smaller opportunity when taken.
    fn need_more_outputs(&mut self, builder: &TransactionBuilder<'_>, denom_value: Amount) -> bool {
        if !builder.could_add_output(denom_value) {
            return false;
        }
        if self.add_final && self.balance_left > 0 && (self.balance_left as u64) < denom_value {
            self.add_final = false;
            log::debug!(
                "planner: final output {} with balance {} left",
                fmt_amount(denom_value),
                self.balance_left
            );
            return true;
        }
        self.balance_left >= denom_value as i64
    }
}

/// How many outputs of `amount` still fit, by value and by the output cap.
fn count_possible_outputs(builder: &TransactionBuilder<'_>, amount: Amount) -> usize {
    let mut planned = Vec::new();
    loop {
        planned.push(amount);
        if !builder.could_add_outputs(&planned)
            || builder.count_outputs() + planned.len() > COINJOIN_DENOM_OUTPUTS_THRESHOLD
        {
            return planned.len() - 1;
        }
    }
}

fn create_denominated_from(
    wallet: &dyn Wallet,
    options: &ClientOptions,
    balance_to_denominate: Amount,
    tally: TallyItem,
    create_collateral: bool,
) -> Result<Txid> {
    // A denominated input is always a single one per address group.
    if tally.inputs.len() == 1 && is_denominated_amount(tally.amount) {
        return Err(Error::TallySkipped("already denominated"));
    }

    let mut builder = TransactionBuilder::new(wallet, tally);
    log::info!("planner: start denominating, {builder}");

    if create_collateral && builder.add_output(max_collateral_amount()).is_none() {
        log::info!("planner: failed to add collateral output");
        return Err(Error::OutputRefused(max_collateral_amount()));
    }

    let smallest = smallest_denomination();
    let largest = STANDARD_DENOMINATIONS[0];
    let mut plan = DenomPlan {
        balance_left: balance_to_denominate as i64,
        add_final: true,
        denom_counts: STANDARD_DENOMINATIONS
            .iter()
            .map(|&d| (d, wallet.count_inputs_with_amount(d)))
            .collect(),
    };

    // Phase 1: round-robin from the smallest denomination up, topping each
    // one up to the goal, then loop while any denomination still has both
    // headroom and budget.
    while builder.could_add_output(smallest)
        && builder.count_outputs() < COINJOIN_DENOM_OUTPUTS_THRESHOLD
    {
        for &denom_value in STANDARD_DENOMINATIONS.iter().rev() {
            let mut current = plan.denom_counts[&denom_value];
            let mut outputs_added = 0usize;

            // Up to 11 per pass, never past the per-denomination goal and
            // never past the transaction-wide output threshold.
            while plan.need_more_outputs(&builder, denom_value)
                && outputs_added <= 10
                && current < options.denoms_goal
                && builder.count_outputs() < COINJOIN_DENOM_OUTPUTS_THRESHOLD
            {
                if builder.add_output(denom_value).is_none() {
                    log::warn!(
                        "planner: add_output failed for {} with {} to go, {builder}",
                        fmt_amount(denom_value),
                        plan.balance_left
                    );
                    return Err(Error::OutputRefused(denom_value));
                }
                outputs_added += 1;
                current += 1;
                plan.balance_left -= denom_value as i64;
                log::debug!(
                    "planner: 1 - {} x{outputs_added}, balance left {}, {builder}",
                    fmt_amount(denom_value),
                    plan.balance_left
                );
            }
            plan.denom_counts.insert(denom_value, current);

            if builder.amount_left() == 0 || plan.balance_left <= 0 {
                break;
            }
        }

        let unfinished = plan.denom_counts.iter().any(|(&denom_value, &count)| {
            count < options.denoms_goal
                && builder.could_add_output(denom_value)
                && plan.balance_left > 0
        });
        if !unfinished {
            break;
        }
    }

    // Phase 2: spend the remainder going large to small, preferring a slight
    // overshoot with bigger denominations over never reaching the target.
    if builder.could_add_output(smallest)
        && plan.balance_left >= smallest as i64
        && builder.count_outputs() < COINJOIN_DENOM_OUTPUTS_THRESHOLD
    {
        log::debug!("planner: 2 - process remainder, {builder}");

        for &denom_value in STANDARD_DENOMINATIONS.iter() {
            if plan.balance_left <= 0 {
                break;
            }
            let to_create_by_space = count_possible_outputs(&builder, denom_value);
            // `+ 1` so the target can be reached even when smaller
            // denominations already sit at their hard cap.
            let to_create_by_value = (plan.balance_left as u64 / denom_value + 1) as usize;
            let to_create = to_create_by_space.min(to_create_by_value);
            log::debug!(
                "planner: 2 - {}: by_space {to_create_by_space}, by_value {to_create_by_value}",
                fmt_amount(denom_value)
            );

            let mut current = plan.denom_counts[&denom_value];
            for _ in 0..to_create {
                // Only the largest denomination may exceed the hard cap.
                if denom_value != largest && current >= options.denoms_hard_cap {
                    break;
                }
                if builder.add_output(denom_value).is_none() {
                    log::warn!("planner: 2 - add_output failed, {builder}");
                    break;
                }
                current += 1;
                plan.balance_left -= denom_value as i64;
                if builder.count_outputs() >= COINJOIN_DENOM_OUTPUTS_THRESHOLD {
                    break;
                }
            }
            plan.denom_counts.insert(denom_value, current);

            if builder.count_outputs() >= COINJOIN_DENOM_OUTPUTS_THRESHOLD {
                break;
            }
        }
    }

    log::info!(
        "planner: 3 - balance left {}, {builder}",
        plan.balance_left
    );

    // A transaction that only creates the mixing collateral is pointless.
    if create_collateral && builder.count_outputs() == 1 {
        return Err(Error::CollateralOnlyPlan);
    }
    if builder.count_outputs() == 0 {
        return Err(Error::EmptyPlan);
    }

    builder.commit()
}

// ── Collateral creation ─────────────────────────────────────────────

/// Produce collateral-sized outputs, trying non-denominated tally items first
/// (smallest balances first, to sweep dust), then denominated ones.
pub fn make_collateral_amounts(wallet: &dyn Wallet, options: &ClientOptions) -> Result<Txid> {
    if !options.enabled {
        return Err(Error::Disabled);
    }

    let mut tallies =
        wallet.select_coins_grouped_by_addresses(false, false, true, MAX_PLAN_INPUTS);
    if tallies.is_empty() {
        log::info!("planner: grouped selection found no inputs for collaterals");
        return Err(Error::NoInputs);
    }
    tallies.sort_by_key(|t| t.amount);

    for tally in &tallies {
        match make_collateral_from(wallet, tally.clone(), false) {
            Ok(txid) => return Ok(txid),
            Err(e) => log::debug!("planner: collateral tally rejected: {e}"),
        }
    }

    // No luck with plain funds; break a denominated output instead.
    for tally in &tallies {
        match make_collateral_from(wallet, tally.clone(), true) {
            Ok(txid) => return Ok(txid),
            Err(e) => log::debug!("planner: collateral tally rejected (denominated): {e}"),
        }
    }

    log::warn!("planner: can't make collaterals at all");
    Err(Error::NoCollateralInputs)
}

fn make_collateral_from(
    wallet: &dyn Wallet,
    tally: TallyItem,
    try_denominated: bool,
) -> Result<Txid> {
    if !try_denominated && tally.inputs.len() == 1 && is_denominated_amount(tally.amount) {
        return Err(Error::TallySkipped("already denominated"));
    }
    // A single input that already works as collateral needs no transaction.
    if tally.inputs.len() == 1 && is_collateral_amount(tally.amount) {
        return Err(Error::TallySkipped("already collateral-sized"));
    }

    let mut builder = TransactionBuilder::new(wallet, tally);
    log::info!("planner: start collaterals, {builder}");

    if !builder.could_add_output(min_collateral_amount()) {
        return Err(Error::TallySkipped("too small for a collateral output"));
    }

    let case;
    if builder.could_add_outputs(&[max_collateral_amount(), min_collateral_amount()]) {
        // Case 1: one max-collateral output plus one output taking the rest.
        case = 1;
        builder
            .add_output(max_collateral_amount())
            .ok_or(Error::OutputRefused(max_collateral_amount()))?;
        let rest = builder.add_placeholder().ok_or(Error::OutputRefused(0))?;
        let amount_left = builder.amount_left();
        // One duff to the fee if the remainder would look like a
        // denomination.
        let amount = if is_denominated_amount(amount_left) {
            amount_left - 1
        } else {
            amount_left
        };
        builder.update_amount(rest, amount);
    } else if builder.could_add_outputs(&[min_collateral_amount(), min_collateral_amount()]) {
        // Case 2: two equal collateral-sized outputs; an odd duff goes to
        // the fee.
        case = 2;
        let first = builder.add_placeholder().ok_or(Error::OutputRefused(0))?;
        let second = builder.add_placeholder().ok_or(Error::OutputRefused(0))?;
        let half = builder.amount_left() / 2;
        debug_assert!(is_collateral_amount(half));
        builder.update_amount(first, half);
        builder.update_amount(second, half);
    } else {
        // Case 3: room for exactly one collateral-sized output.
        case = 3;
        let only = builder.add_placeholder().ok_or(Error::OutputRefused(0))?;
        let amount_left = builder.amount_left();
        builder.update_amount(only, amount_left);
        debug_assert!(is_collateral_amount(builder.output_amount(only)));
    }

    log::info!("planner: collateral case {case}, {builder}");

    let remainder = builder.amount_left();
    if !builder.is_dust(remainder) {
        return Err(Error::RemainderNotDust(remainder));
    }

    builder.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denom::COIN;
    use crate::testing::MemoryWallet;

    fn options() -> ClientOptions {
        ClientOptions {
            denoms_goal: 11,
            denoms_hard_cap: 20,
            ..ClientOptions::default()
        }
    }

    #[test]
    fn disabled_options_refuse_to_plan() {
        let wallet = MemoryWallet::new();
        wallet.fund_address(&[10 * COIN], 10);
        let opts = ClientOptions {
            enabled: false,
            ..options()
        };
        assert!(matches!(
            create_denominated(&wallet, &opts, 10 * COIN),
            Err(Error::Disabled)
        ));
        assert!(matches!(
            make_collateral_amounts(&wallet, &opts),
            Err(Error::Disabled)
        ));
    }

    #[test]
    fn denominated_single_input_tally_is_skipped() {
        let wallet = MemoryWallet::new();
        wallet.fund_address(&[STANDARD_DENOMINATIONS[1]], 10);
        assert!(create_denominated(&wallet, &options(), COIN).is_err());
    }

    #[test]
    fn final_smaller_output_is_placed_once() {
        let wallet = MemoryWallet::new();
        // Enough money in the tally, but a tiny denomination budget: only the
        // single final-smaller output should be created.
        wallet.fund_address(&[COIN], 10);
        let txid = create_denominated(&wallet, &options(), 50_000).unwrap();
        let tx = wallet.get_transaction(&txid).unwrap();
        let denominated: Vec<_> = tx
            .outputs
            .iter()
            .filter(|o| is_denominated_amount(o.value))
            .collect();
        assert_eq!(denominated.len(), 1);
        assert_eq!(denominated[0].value, smallest_denomination());
    }

    #[test]
    fn collateral_case_three_sweeps_small_tally() {
        let wallet = MemoryWallet::new();
        // Room for one collateral output only: 18_000 minus fees.
        wallet.fund_address(&[18_000], 10);
        let txid = make_collateral_amounts(&wallet, &ClientOptions::default()).unwrap();
        let tx = wallet.get_transaction(&txid).unwrap();
        assert_eq!(tx.outputs.len(), 1);
        assert!(is_collateral_amount(tx.outputs[0].value));
    }

    #[test]
    fn collateral_case_one_splits_max_plus_change() {
        let wallet = MemoryWallet::new();
        wallet.fund_address(&[120_000], 10);
        let txid = make_collateral_amounts(&wallet, &ClientOptions::default()).unwrap();
        let tx = wallet.get_transaction(&txid).unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, max_collateral_amount());
        assert!(tx.outputs[1].value >= min_collateral_amount());
        assert!(!is_denominated_amount(tx.outputs[1].value));
    }
}
