//! End-to-end planner scenarios against the in-memory wallet.

use std::collections::HashMap;

use churn_sdk::denom::{
    is_collateral_amount, is_denominated_amount, largest_denomination, max_collateral_amount,
    Amount, COIN, COINJOIN_DENOM_OUTPUTS_THRESHOLD,
};
use churn_sdk::planner::{create_denominated, make_collateral_amounts};
use churn_sdk::testing::MemoryWallet;
use churn_sdk::{ClientOptions, Wallet};

fn options(goal: usize, hard_cap: usize) -> ClientOptions {
    ClientOptions {
        denoms_goal: goal,
        denoms_hard_cap: hard_cap,
        ..ClientOptions::default()
    }
}

#[test]
fn denomination_creation_round_robin_fill() {
    let wallet = MemoryWallet::new();
    // A single confirmed non-denominated tally of 10 units, no collaterals
    // yet, so one extra collateral output will be planned as well.
    wallet.fund_address(&[10 * COIN], 10);
    let opts = options(11, 20);

    let txid = create_denominated(&wallet, &opts, 10 * COIN).unwrap();
    let tx = wallet.get_transaction(&txid).unwrap();

    assert!(tx.outputs.len() >= 40, "got {} outputs", tx.outputs.len());
    assert!(tx.outputs.len() <= COINJOIN_DENOM_OUTPUTS_THRESHOLD);

    let mut counts: HashMap<Amount, usize> = HashMap::new();
    let mut collateral_outputs = 0;
    for output in &tx.outputs {
        if is_denominated_amount(output.value) {
            *counts.entry(output.value).or_insert(0) += 1;
        } else {
            assert_eq!(output.value, max_collateral_amount());
            collateral_outputs += 1;
        }
    }
    assert_eq!(collateral_outputs, 1);

    // The remainder pass may exceed the soft goal, but only the largest
    // denomination may pass the hard cap.
    for (&value, &count) in &counts {
        if value != largest_denomination() {
            assert!(
                count <= opts.denoms_hard_cap,
                "denom {value} created {count} times"
            );
        }
    }

    // Committing does not lock anything.
    assert_eq!(wallet.locked_count(), 0);
    assert_eq!(wallet.reserved_key_count(), 0);
}

#[test]
fn denomination_creation_respects_output_threshold() {
    let wallet = MemoryWallet::new();
    wallet.fund_address(&[1000 * COIN], 10);
    // Generous caps: the output-count threshold must do the limiting.
    let opts = options(200, 100_000);

    let txid = create_denominated(&wallet, &opts, 1000 * COIN).unwrap();
    let tx = wallet.get_transaction(&txid).unwrap();
    assert!(tx.outputs.len() <= COINJOIN_DENOM_OUTPUTS_THRESHOLD);
}

#[test]
fn collateral_case_two_splits_evenly() {
    let wallet = MemoryWallet::new();
    // Too small for max + min collateral outputs, big enough for two equal
    // collateral-sized halves.
    wallet.fund_address(&[45_000], 10);

    let txid = make_collateral_amounts(&wallet, &ClientOptions::default()).unwrap();
    let tx = wallet.get_transaction(&txid).unwrap();

    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.outputs[0].value, tx.outputs[1].value);
    for output in &tx.outputs {
        assert!(is_collateral_amount(output.value), "value {}", output.value);
    }
}

#[test]
fn collateral_skips_tallies_that_already_work() {
    let wallet = MemoryWallet::new();
    // A lone collateral-sized coin needs no transaction at all.
    wallet.fund_address(&[20_000], 10);
    assert!(make_collateral_amounts(&wallet, &ClientOptions::default()).is_err());
}
