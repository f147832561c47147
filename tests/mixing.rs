//! Full mixing round-trips against a scripted coordinator: the manager, the
//! orchestrator, one session and the wire messages, end to end.

use std::sync::Arc;

use churn_sdk::denom::COIN;
use churn_sdk::messages::{
    BroadcastTx, Complete, FinalTransaction, PoolMessage, PoolState, PoolStatusUpdate,
    StatusUpdate,
};
use churn_sdk::progress::MixingProgress;
use churn_sdk::testing::{
    signed_queue_denom, test_coordinator, test_signature, ChannelNetwork, MemoryWallet,
    StaticRegistry, StubChain,
};
use churn_sdk::tx::{Outpoint, Script, Transaction, TxIn, TxOut, Txid};
use churn_sdk::{ClientOptions, Denomination, MixManager, NetMessage};

struct Harness {
    wallet: Arc<MemoryWallet>,
    network: Arc<ChannelNetwork>,
    manager: MixManager,
    coordinator: churn_sdk::Coordinator,
    denom: Denomination,
}

fn harness() -> Harness {
    let coordinator = test_coordinator(1);
    let wallet = Arc::new(MemoryWallet::new());
    let registry = Arc::new(StaticRegistry::new(vec![coordinator]));
    let chain = Arc::new(StubChain::synced_at(100));
    let network = Arc::new(ChannelNetwork::new());
    let manager = MixManager::new(registry, chain, network.clone(), 4);

    let denom = Denomination::from_wire(8).unwrap();
    wallet.fund_denominated(denom, 5, 0);
    wallet.fund_collateral(2, 30_000);

    Harness {
        wallet,
        network,
        manager,
        coordinator,
        denom,
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        amount: COIN,
        ..ClientOptions::default()
    }
}

#[test]
fn full_happy_path_with_scripted_coordinator() {
    let h = harness();
    let orchestrator = h
        .manager
        .register_wallet("alice", h.wallet.clone(), options());
    let mut progress = MixingProgress::new(orchestrator.subscribe());
    let from = h.coordinator.address;

    // Tick 1: a session starts, a connection to the coordinator is opened
    // and the accept request is held back until it completes.
    h.manager.do_maintenance(1000);
    assert_eq!(
        orchestrator.session_states(),
        vec![(0, PoolState::Queue, 0)]
    );
    assert!(h.network.sent_with_command("dsa").is_empty());

    // Tick 2: connection is up, the dsa goes out.
    h.network.complete_pending_connects();
    h.manager.do_maintenance(1001);
    let dsa = h.network.sent_with_command("dsa");
    assert_eq!(dsa.len(), 1);
    let NetMessage::Accept(accept) = &dsa[0] else {
        panic!("expected dsa");
    };
    assert_eq!(accept.denomination, h.denom.to_wire());
    assert!(!accept.collateral.inputs.is_empty());

    // The coordinator accepts us into its queue.
    h.manager.process_message(
        from,
        NetMessage::StatusUpdate(StatusUpdate {
            session_id: 777,
            state: PoolState::Queue as i32,
            status_update: PoolStatusUpdate::Accepted as i32,
            message_id: PoolMessage::MsgNoErr as i32,
        }),
        1002,
    );
    assert_eq!(
        orchestrator.session_states(),
        vec![(0, PoolState::Queue, 777)]
    );

    // The queue goes ready: our entry is prepared and submitted.
    h.manager.process_message(
        from,
        NetMessage::Queue(signed_queue_denom(&h.coordinator, h.denom, 1002, true)),
        1002,
    );
    assert_eq!(
        orchestrator.session_states(),
        vec![(0, PoolState::AcceptingEntries, 777)]
    );
    let dsi = h.network.sent_with_command("dsi");
    assert_eq!(dsi.len(), 1);
    let NetMessage::Entry(entry) = dsi[0].clone() else {
        panic!("expected dsi");
    };
    assert!(!entry.inputs.is_empty());
    assert_eq!(entry.inputs.len(), entry.outputs.len());
    for output in &entry.outputs {
        assert_eq!(output.value, h.denom.amount());
    }
    // The submitted inputs are locked for the session.
    for input in &entry.inputs {
        assert!(h.wallet.is_locked(&input.prev_out));
    }

    // Progress update from the coordinator (no state change).
    h.manager.process_message(
        from,
        NetMessage::StatusUpdate(StatusUpdate {
            session_id: 777,
            state: PoolState::AcceptingEntries as i32,
            status_update: PoolStatusUpdate::Accepted as i32,
            message_id: PoolMessage::MsgEntriesAdded as i32,
        }),
        1003,
    );

    // The final transaction: our contribution plus another participant's.
    let mut final_tx = Transaction::new();
    final_tx.inputs = entry.inputs.clone();
    final_tx.outputs = entry.outputs.clone();
    final_tx
        .inputs
        .push(TxIn::from_outpoint(Outpoint::new(Txid([0xee; 32]), 0)));
    final_tx
        .outputs
        .push(TxOut::new(h.denom.amount(), Script::p2pkh(&[0xee; 20])));

    h.manager.process_message(
        from,
        NetMessage::FinalTransaction(FinalTransaction {
            session_id: 777,
            tx: final_tx.clone(),
        }),
        1004,
    );
    assert_eq!(
        orchestrator.session_states(),
        vec![(0, PoolState::Signing, 777)]
    );
    let dss = h.network.sent_with_command("dss");
    assert_eq!(dss.len(), 1);
    let NetMessage::SignedInputs(signed) = &dss[0] else {
        panic!("expected dss");
    };
    assert_eq!(signed.inputs.len(), entry.inputs.len());

    // Completion: keys kept, coins unlocked, session back to Idle.
    let reserved_before = h.wallet.reserved_key_count();
    assert_eq!(reserved_before, entry.outputs.len());
    h.manager.process_message(
        from,
        NetMessage::Complete(Complete {
            session_id: 777,
            message_id: PoolMessage::MsgSuccess as i32,
        }),
        1005,
    );
    assert_eq!(orchestrator.session_states(), vec![(0, PoolState::Idle, 0)]);
    assert_eq!(h.wallet.locked_count(), 0);
    assert_eq!(h.wallet.reserved_key_count(), 0);
    assert!(h.wallet.kept_key_count() >= entry.outputs.len());
    assert_eq!(orchestrator.locked_outpoint_count(), 0);

    // The coordinator publishes the mixed transaction.
    let mut dstx = BroadcastTx {
        tx: final_tx.clone(),
        coordinator_outpoint: h.coordinator.outpoint,
        time: 1005,
        signature: Vec::new(),
    };
    dstx.signature = test_signature(&h.coordinator.outpoint, &dstx.signature_hash());
    h.manager
        .process_message(from, NetMessage::BroadcastTx(dstx), 1005);
    assert!(h.manager.has_broadcast_tx(&final_tx.txid()));

    // The observer saw exactly one successful session.
    progress.poll(h.wallet.as_ref());
    assert_eq!(progress.completed_sessions(), 1);
    assert_eq!(progress.timed_out_sessions(), 0);
}

#[test]
fn ready_queue_is_joined_instead_of_starting_new() {
    let h = harness();
    let orchestrator = h
        .manager
        .register_wallet("alice", h.wallet.clone(), options());

    // A ready advertisement arrives before any session exists; nothing is
    // waiting on this coordinator yet so it is only stored.
    h.manager.process_message(
        h.coordinator.address,
        NetMessage::Queue(signed_queue_denom(&h.coordinator, h.denom, 999, true)),
        999,
    );
    assert_eq!(h.manager.queue_listener().len(), 1);

    // The next tick joins the advertised queue.
    assert!(orchestrator.do_automatic_denominating(1000));
    let states = orchestrator.session_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1, PoolState::Queue);

    // The advertisement was consumed; it cannot be joined twice.
    assert!(h.manager.queue_listener().next_ready(1001).is_none());
}

#[test]
fn rejection_frees_the_session_for_a_retry() {
    let h = harness();
    let orchestrator = h
        .manager
        .register_wallet("alice", h.wallet.clone(), options());
    let from = h.coordinator.address;

    h.manager.do_maintenance(1000);
    h.network.complete_pending_connects();
    h.manager.do_maintenance(1001);

    h.manager.process_message(
        from,
        NetMessage::StatusUpdate(StatusUpdate {
            session_id: 0,
            state: PoolState::Queue as i32,
            status_update: PoolStatusUpdate::Rejected as i32,
            message_id: PoolMessage::ErrQueueFull as i32,
        }),
        1002,
    );
    assert_eq!(
        orchestrator.session_states(),
        vec![(0, PoolState::Error, 0)]
    );
    assert_eq!(h.wallet.locked_count(), 0);

    // After the error cooldown the session resets and retries from Idle.
    h.manager.do_maintenance(1013);
    let states = orchestrator.session_states();
    assert_eq!(states.len(), 1);
    assert_ne!(states[0].1, PoolState::Error);
}
