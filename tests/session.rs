//! Session state machine scenarios: refusal discipline and timeouts.

use std::sync::Arc;

use churn_sdk::denom::max_pool_amount;
use churn_sdk::messages::{
    Complete, FinalTransaction, PoolMessage, PoolState, PoolStatusUpdate, StatusMessage,
    StatusUpdate,
};
use churn_sdk::pool::CoordinatorPool;
use churn_sdk::session::MixSession;
use churn_sdk::testing::{test_coordinator, ChannelNetwork, MemoryWallet, StaticRegistry};
use churn_sdk::tx::{Outpoint, Script, Transaction, TxIn, TxOut, Txid};
use churn_sdk::{ClientOptions, Coordinator, Denomination, NetMessage, Wallet};

struct Harness {
    wallet: MemoryWallet,
    network: Arc<ChannelNetwork>,
    pool: CoordinatorPool,
    coordinator: Coordinator,
}

fn harness() -> Harness {
    let coordinator = test_coordinator(1);
    let network = Arc::new(ChannelNetwork::new());
    let registry = Arc::new(StaticRegistry::new(vec![coordinator]));
    Harness {
        wallet: MemoryWallet::new(),
        network: network.clone(),
        pool: CoordinatorPool::new(network, registry, 4),
        coordinator,
    }
}

/// A collateral transaction spending one funded collateral coin into fees.
fn collateral_tx(wallet: &MemoryWallet) -> Transaction {
    let outpoint = wallet.fund_collateral(1, 30_000)[0];
    let mut tx = Transaction::new();
    tx.inputs.push(TxIn::from_outpoint(outpoint));
    tx.outputs.push(TxOut::new(0, Script::op_return()));
    wallet.sign_transaction(&mut tx).unwrap();
    tx
}

/// Drive a session into AcceptingEntries with one submitted entry.
fn session_with_entry(h: &Harness, session: &mut MixSession, now: i64) {
    let denom = Denomination::smallest();
    h.wallet.fund_denominated(denom, 3, 0);

    session.start_queue(denom, h.coordinator, collateral_tx(&h.wallet), now);
    h.pool.add_pending(session.id(), h.coordinator);
    h.network.complete_pending_connects();
    assert!(session.process_pending_request(&h.wallet, &h.pool, now + 1));

    session.process_status_update(
        &h.coordinator.address,
        &StatusUpdate {
            session_id: 777,
            state: PoolState::Queue as i32,
            status_update: PoolStatusUpdate::Accepted as i32,
            message_id: PoolMessage::MsgNoErr as i32,
        },
        &h.wallet,
        now + 2,
    );
    assert_eq!(session.session_id(), 777);

    let dsins = h.wallet.select_dsins_by_denomination(denom, max_pool_amount());
    let pairs = session
        .prepare_denominate(&h.wallet, &dsins, 0, 0, false)
        .unwrap();
    assert!(session.send_denominate(pairs, &h.wallet, &h.pool, now + 3));
    assert_eq!(session.state(), PoolState::AcceptingEntries);
    assert_eq!(h.network.sent_with_command("dsi").len(), 1);
}

#[test]
fn refuses_to_sign_when_own_output_is_missing() {
    let h = harness();
    let mut session = MixSession::new(0);
    session_with_entry(&h, &mut session, 1000);

    let NetMessage::Entry(entry) = h.network.sent_with_command("dsi")[0].clone() else {
        panic!("expected an entry");
    };

    // The coordinator swaps one of our outputs for somebody else's script.
    let mut tx = Transaction::new();
    tx.inputs = entry.inputs.clone();
    tx.outputs = entry.outputs.clone();
    tx.outputs[0].script_pubkey = Script::p2pkh(&[0xee; 20]);

    session.process_final_transaction(
        &h.coordinator.address,
        &FinalTransaction {
            session_id: 777,
            tx,
        },
        &h.wallet,
        &h.pool,
        &ClientOptions::default(),
        1010,
    );

    assert_eq!(session.state(), PoolState::Error);
    assert!(h.network.sent_with_command("dss").is_empty());
    assert_eq!(h.wallet.locked_count(), 0);
    assert_eq!(h.wallet.reserved_key_count(), 0);
    assert_eq!(h.wallet.kept_key_count(), 0);
}

#[test]
fn signs_when_final_tx_matches_entry() {
    let h = harness();
    let mut session = MixSession::new(0);
    session_with_entry(&h, &mut session, 1000);

    let NetMessage::Entry(entry) = h.network.sent_with_command("dsi")[0].clone() else {
        panic!("expected an entry");
    };

    // Exactly our inputs/outputs plus one other participant.
    let mut tx = Transaction::new();
    tx.inputs = entry.inputs.clone();
    tx.outputs = entry.outputs.clone();
    tx.inputs
        .push(TxIn::from_outpoint(Outpoint::new(Txid([0xee; 32]), 0)));
    tx.outputs.push(TxOut::new(
        Denomination::smallest().amount(),
        Script::p2pkh(&[0xee; 20]),
    ));

    session.process_final_transaction(
        &h.coordinator.address,
        &FinalTransaction {
            session_id: 777,
            tx,
        },
        &h.wallet,
        &h.pool,
        &ClientOptions::default(),
        1010,
    );

    assert_eq!(session.state(), PoolState::Signing);
    let signed = h.network.sent_with_command("dss");
    assert_eq!(signed.len(), 1);
    let NetMessage::SignedInputs(signed) = &signed[0] else {
        panic!("expected signed inputs");
    };
    // Only our own inputs are signed.
    assert_eq!(signed.inputs.len(), entry.inputs.len());
    for input in &signed.inputs {
        assert!(entry
            .inputs
            .iter()
            .any(|e| e.prev_out == input.prev_out));
        assert!(!input.script_sig.is_empty());
    }
}

#[test]
fn mismatched_session_id_is_ignored() {
    let h = harness();
    let mut session = MixSession::new(0);
    session_with_entry(&h, &mut session, 1000);

    let NetMessage::Entry(entry) = h.network.sent_with_command("dsi")[0].clone() else {
        panic!("expected an entry");
    };
    let mut tx = Transaction::new();
    tx.inputs = entry.inputs;
    tx.outputs = entry.outputs;

    session.process_final_transaction(
        &h.coordinator.address,
        &FinalTransaction {
            session_id: 778,
            tx,
        },
        &h.wallet,
        &h.pool,
        &ClientOptions::default(),
        1010,
    );
    assert_eq!(session.state(), PoolState::AcceptingEntries);
    assert!(h.network.sent_with_command("dss").is_empty());
}

#[test]
fn queue_timeout_releases_resources() {
    let h = harness();
    let mut session = MixSession::new(0);
    let denom = Denomination::smallest();
    let tx = collateral_tx(&h.wallet);
    let collateral_input = tx.inputs[0].prev_out;

    session.start_queue(denom, h.coordinator, tx, 1000);
    session.lock_coin(&h.wallet, collateral_input);
    assert!(h.wallet.is_locked(&collateral_input));

    // Just inside the deadline: nothing happens.
    assert!(!session.check_timeout(&h.wallet, &h.pool, 1000 + 39));
    assert_eq!(session.state(), PoolState::Queue);

    // Queue timeout plus lag exceeded.
    assert!(session.check_timeout(&h.wallet, &h.pool, 1000 + 41));
    assert_eq!(session.state(), PoolState::Error);
    assert_eq!(
        session.last_message(),
        StatusMessage::Pool(PoolMessage::ErrSession)
    );
    assert_eq!(h.wallet.locked_count(), 0);
    assert_eq!(h.wallet.reserved_key_count(), 0);

    // Error auto-resets to Idle after ten seconds.
    assert!(!session.check_timeout(&h.wallet, &h.pool, 1000 + 45));
    assert_eq!(session.state(), PoolState::Error);
    assert!(!session.check_timeout(&h.wallet, &h.pool, 1000 + 52));
    assert_eq!(session.state(), PoolState::Idle);
}

#[test]
fn success_completion_keeps_keys_and_resets() {
    let h = harness();
    let mut session = MixSession::new(0);
    session_with_entry(&h, &mut session, 1000);
    let reserved = h.wallet.reserved_key_count();
    assert!(reserved > 0);

    let outcome = session
        .process_complete(
            &h.coordinator.address,
            &Complete {
                session_id: 777,
                message_id: PoolMessage::MsgSuccess as i32,
            },
            &h.wallet,
            &h.pool,
        )
        .unwrap();

    assert_eq!(outcome.message, PoolMessage::MsgSuccess);
    assert_eq!(session.state(), PoolState::Idle);
    assert_eq!(session.session_id(), 0);
    assert_eq!(h.wallet.locked_count(), 0);
    assert_eq!(h.wallet.reserved_key_count(), 0);
    assert_eq!(h.wallet.kept_key_count(), reserved);
}
