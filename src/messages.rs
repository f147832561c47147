//! Wire message payloads and protocol enums.
//!
//! Payload layouts mirror the upstream protocol: little-endian integers,
//! compact-size vectors, transactions in their consensus encoding. Queue and
//! broadcast-transaction messages are BLS-signed by the coordinator; the hash
//! they sign is computed here, verification itself happens behind
//! [`CoordinatorRegistry`](crate::registry::CoordinatorRegistry).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::denom::COINJOIN_QUEUE_TIMEOUT;
use crate::tx::{double_sha256, Outpoint, Transaction, TxIn, TxOut};
use crate::wire::{encode, SliceReader, WireDecode, WireEncode};
use crate::Result;

// ── Protocol enums ──────────────────────────────────────────────────

/// Coordinator-reported pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Idle = 0,
    Queue = 1,
    AcceptingEntries = 2,
    Signing = 3,
    Error = 4,
}

impl PoolState {
    pub const MIN: i32 = PoolState::Idle as i32;
    pub const MAX: i32 = PoolState::Error as i32;

    pub fn from_raw(raw: i32) -> Option<PoolState> {
        match raw {
            0 => Some(PoolState::Idle),
            1 => Some(PoolState::Queue),
            2 => Some(PoolState::AcceptingEntries),
            3 => Some(PoolState::Signing),
            4 => Some(PoolState::Error),
            _ => None,
        }
    }
}

/// Accept/reject verdict inside a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatusUpdate {
    Rejected = 0,
    Accepted = 1,
}

impl PoolStatusUpdate {
    pub fn from_raw(raw: i32) -> Option<PoolStatusUpdate> {
        match raw {
            0 => Some(PoolStatusUpdate::Rejected),
            1 => Some(PoolStatusUpdate::Accepted),
            _ => None,
        }
    }
}

/// Detailed result codes carried by status updates and completion messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMessage {
    ErrAlreadyHave = 0,
    ErrDenom = 1,
    ErrEntriesFull = 2,
    ErrExistingTx = 3,
    ErrFees = 4,
    ErrInvalidCollateral = 5,
    ErrInvalidInput = 6,
    ErrInvalidScript = 7,
    ErrInvalidTx = 8,
    ErrMaximum = 9,
    ErrCoordinatorList = 10,
    ErrMode = 11,
    ErrNonStandardPubkey = 12,
    ErrNotACoordinator = 13,
    ErrQueueFull = 14,
    ErrRecent = 15,
    ErrSession = 16,
    ErrMissingTx = 17,
    ErrVersion = 18,
    MsgNoErr = 19,
    MsgSuccess = 20,
    MsgEntriesAdded = 21,
    ErrSizeMismatch = 22,
}

impl PoolMessage {
    pub const MIN: i32 = PoolMessage::ErrAlreadyHave as i32;
    pub const MAX: i32 = PoolMessage::ErrSizeMismatch as i32;

    pub fn from_raw(raw: i32) -> Option<PoolMessage> {
        use PoolMessage::*;
        Some(match raw {
            0 => ErrAlreadyHave,
            1 => ErrDenom,
            2 => ErrEntriesFull,
            3 => ErrExistingTx,
            4 => ErrFees,
            5 => ErrInvalidCollateral,
            6 => ErrInvalidInput,
            7 => ErrInvalidScript,
            8 => ErrInvalidTx,
            9 => ErrMaximum,
            10 => ErrCoordinatorList,
            11 => ErrMode,
            12 => ErrNonStandardPubkey,
            13 => ErrNotACoordinator,
            14 => ErrQueueFull,
            15 => ErrRecent,
            16 => ErrSession,
            17 => ErrMissingTx,
            18 => ErrVersion,
            19 => MsgNoErr,
            20 => MsgSuccess,
            21 => MsgEntriesAdded,
            22 => ErrSizeMismatch,
            _ => return None,
        })
    }

    /// The one place protocol result codes are turned into user-facing text.
    pub fn describe(self) -> &'static str {
        use PoolMessage::*;
        match self {
            ErrAlreadyHave => "Already have that input.",
            ErrDenom => "No matching denominations found for mixing.",
            ErrEntriesFull => "Entries are full.",
            ErrExistingTx => "Not compatible with existing transactions.",
            ErrFees => "Transaction fees are too high.",
            ErrInvalidCollateral => "Collateral not valid.",
            ErrInvalidInput => "Input is not valid.",
            ErrInvalidScript => "Invalid script detected.",
            ErrInvalidTx => "Transaction not valid.",
            ErrMaximum => "Entry exceeds maximum size.",
            ErrCoordinatorList => "Not in the coordinator list.",
            ErrMode => "Incompatible mode.",
            ErrNonStandardPubkey => "Non-standard public key detected.",
            ErrNotACoordinator => "This is not a coordinator.",
            ErrQueueFull => "Queue is full.",
            ErrRecent => "Last queue was created too recently.",
            ErrSession => "Session not complete!",
            ErrMissingTx => "Missing input transaction information.",
            ErrVersion => "Incompatible version.",
            MsgNoErr => "No errors detected.",
            MsgSuccess => "Transaction created successfully.",
            MsgEntriesAdded => "Your entries were added successfully.",
            ErrSizeMismatch => "Inputs vs outputs size mismatch.",
        }
    }
}

impl fmt::Display for PoolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Orchestrator-level outcome reported when a mixing run winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Mixing,
    Finished,
    ErrNoCoordinators,
    ErrNotEnoughFunds,
    ErrNoInputs,
    WarnNoMixingQueues,
    WarnNoCompatibleCoordinator,
}

// ── Status text ─────────────────────────────────────────────────────

/// Every human-readable status the engine can report, rendered by a single
/// formatter instead of string concatenation at the call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    Idle,
    NotSynced,
    WalletLocked,
    NoCoordinators,
    NothingToDo,
    NotEnoughFunds,
    MixingInProgress,
    LockInPlace,
    LastActionTooRecent,
    UnconfirmedDenoms,
    TryingToConnect,
    InQueue,
    SigningStatus,
    NoQueueToJoin,
    FailedToStartQueue,
    NoCompatibleCoordinator,
    NoCompatibleInputs,
    NoRandomCoordinator,
    PendingEntries,
    InvalidSessionDenom,
    CantSelectInputs,
    CantPrepareOutputs,
    Pool(PoolMessage),
    Coordinator(PoolMessage),
    Incomplete(PoolMessage),
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use StatusMessage::*;
        match self {
            Idle => f.write_str("Mixing is idle."),
            NotSynced => f.write_str("Can't mix while sync is in progress."),
            WalletLocked => f.write_str("Wallet is locked."),
            NoCoordinators => f.write_str("No coordinators detected."),
            NothingToDo => f.write_str("Nothing to do."),
            NotEnoughFunds => f.write_str("Not enough funds to mix."),
            MixingInProgress => f.write_str("Mixing in progress..."),
            LockInPlace => f.write_str("Lock is already in place."),
            LastActionTooRecent => f.write_str("Last successful action was too recent."),
            UnconfirmedDenoms => f.write_str(
                "Found unconfirmed denominated outputs, will wait till they confirm to continue.",
            ),
            TryingToConnect => f.write_str("Trying to connect..."),
            InQueue => f.write_str("Submitted to coordinator, waiting in queue..."),
            SigningStatus => f.write_str("Found enough users, signing..."),
            NoQueueToJoin => f.write_str("Failed to find mixing queue to join."),
            FailedToStartQueue => f.write_str("Failed to start a new mixing queue."),
            NoCompatibleCoordinator => f.write_str("No compatible coordinator found."),
            NoCompatibleInputs => f.write_str("Can't mix: no compatible inputs found!"),
            NoRandomCoordinator => f.write_str("Can't find a random coordinator."),
            PendingEntries => f.write_str("Already have pending entries in the mixing pool."),
            InvalidSessionDenom => f.write_str("Incorrect session denomination."),
            CantSelectInputs => f.write_str("Can't select current denominated inputs."),
            CantPrepareOutputs => f.write_str("Can't prepare current denominated outputs."),
            Pool(msg) => write!(f, "{msg}"),
            Coordinator(msg) => write!(f, "Coordinator: {msg}"),
            Incomplete(msg) => write!(f, "Mixing request incomplete: {msg} Will retry..."),
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// `dsa`: ask a coordinator to accept us into a mixing queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub denomination: u32,
    pub collateral: Transaction,
}

/// `dsq`: public advertisement that a coordinator has an open queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub denomination: u32,
    pub coordinator_outpoint: Outpoint,
    pub time: i64,
    pub ready: bool,
    pub signature: Vec<u8>,
}

impl Queue {
    /// Hash the coordinator's operator key signed: all fields but the
    /// signature itself.
    pub fn signature_hash(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(64);
        self.denomination.encode_to(&mut buf);
        self.coordinator_outpoint.encode_to(&mut buf);
        self.time.encode_to(&mut buf);
        self.ready.encode_to(&mut buf);
        double_sha256(&buf)
    }

    /// A queue is stale once its timestamp drifts outside the window in
    /// either direction.
    pub fn is_time_out_of_bounds(&self, now: i64) -> bool {
        now - self.time > COINJOIN_QUEUE_TIMEOUT || self.time - now > COINJOIN_QUEUE_TIMEOUT
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queue(denom={}, coordinator={}, time={}, ready={})",
            self.denomination, self.coordinator_outpoint, self.time, self.ready
        )
    }
}

/// `dssu`: coordinator progress report. Raw ids are range-checked by the
/// session handler, not here, so hostile values survive decoding and can be
/// dropped with logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub session_id: i32,
    pub state: i32,
    pub status_update: i32,
    pub message_id: i32,
}

impl StatusUpdate {
    pub fn pool_state(&self) -> Option<PoolState> {
        PoolState::from_raw(self.state)
    }

    pub fn status(&self) -> Option<PoolStatusUpdate> {
        PoolStatusUpdate::from_raw(self.status_update)
    }

    pub fn message(&self) -> Option<PoolMessage> {
        PoolMessage::from_raw(self.message_id)
    }
}

/// `dsi`: our contribution to the mix: inputs, outputs, collateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub collateral: Transaction,
}

/// `dsf`: the assembled transaction the coordinator wants signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalTransaction {
    pub session_id: i32,
    pub tx: Transaction,
}

/// `dss`: our signed inputs, pushed back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInputs {
    pub inputs: Vec<TxIn>,
}

/// `dsc`: session outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {
    pub session_id: i32,
    pub message_id: i32,
}

/// `dstx`: the coordinator publishing the mixed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTx {
    pub tx: Transaction,
    pub coordinator_outpoint: Outpoint,
    pub time: i64,
    pub signature: Vec<u8>,
}

impl BroadcastTx {
    pub fn signature_hash(&self) -> [u8; 32] {
        let mut buf = Vec::new();
        self.tx.txid().encode_to(&mut buf);
        self.coordinator_outpoint.encode_to(&mut buf);
        self.time.encode_to(&mut buf);
        double_sha256(&buf)
    }
}

// ── Wire codec impls ────────────────────────────────────────────────

macro_rules! impl_payload_wire {
    ($ty:ty, $($field:ident: $fty:ty),+) => {
        impl WireEncode for $ty {
            fn encode_to(&self, out: &mut Vec<u8>) {
                $(self.$field.encode_to(out);)+
            }
        }

        impl WireDecode for $ty {
            fn decode_from(r: &mut SliceReader<'_>) -> Result<$ty> {
                Ok(Self {
                    $($field: <$fty>::decode_from(r)?,)+
                })
            }
        }
    };
}

impl_payload_wire!(Accept, denomination: u32, collateral: Transaction);
impl_payload_wire!(
    Queue,
    denomination: u32,
    coordinator_outpoint: Outpoint,
    time: i64,
    ready: bool,
    signature: Vec<u8>
);
impl_payload_wire!(
    StatusUpdate,
    session_id: i32,
    state: i32,
    status_update: i32,
    message_id: i32
);
impl_payload_wire!(
    Entry,
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    collateral: Transaction
);
impl_payload_wire!(FinalTransaction, session_id: i32, tx: Transaction);
impl_payload_wire!(SignedInputs, inputs: Vec<TxIn>);
impl_payload_wire!(Complete, session_id: i32, message_id: i32);
impl_payload_wire!(
    BroadcastTx,
    tx: Transaction,
    coordinator_outpoint: Outpoint,
    time: i64,
    signature: Vec<u8>
);

// ── Dispatch enum ───────────────────────────────────────────────────

/// A decoded protocol message, tagged with its wire command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMessage {
    Accept(Accept),
    Queue(Queue),
    StatusUpdate(StatusUpdate),
    Entry(Entry),
    FinalTransaction(FinalTransaction),
    SignedInputs(SignedInputs),
    Complete(Complete),
    BroadcastTx(BroadcastTx),
}

impl NetMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetMessage::Accept(_) => "dsa",
            NetMessage::Queue(_) => "dsq",
            NetMessage::StatusUpdate(_) => "dssu",
            NetMessage::Entry(_) => "dsi",
            NetMessage::FinalTransaction(_) => "dsf",
            NetMessage::SignedInputs(_) => "dss",
            NetMessage::Complete(_) => "dsc",
            NetMessage::BroadcastTx(_) => "dstx",
        }
    }

    /// Payload body bytes (framing is the network layer's concern).
    pub fn payload(&self) -> Vec<u8> {
        match self {
            NetMessage::Accept(m) => encode(m),
            NetMessage::Queue(m) => encode(m),
            NetMessage::StatusUpdate(m) => encode(m),
            NetMessage::Entry(m) => encode(m),
            NetMessage::FinalTransaction(m) => encode(m),
            NetMessage::SignedInputs(m) => encode(m),
            NetMessage::Complete(m) => encode(m),
            NetMessage::BroadcastTx(m) => encode(m),
        }
    }

    /// Rebuild a message from its command and payload body.
    pub fn from_payload(command: &str, payload: &[u8]) -> Result<NetMessage> {
        use crate::wire::decode;
        Ok(match command {
            "dsa" => NetMessage::Accept(decode(payload)?),
            "dsq" => NetMessage::Queue(decode(payload)?),
            "dssu" => NetMessage::StatusUpdate(decode(payload)?),
            "dsi" => NetMessage::Entry(decode(payload)?),
            "dsf" => NetMessage::FinalTransaction(decode(payload)?),
            "dss" => NetMessage::SignedInputs(decode(payload)?),
            "dsc" => NetMessage::Complete(decode(payload)?),
            "dstx" => NetMessage::BroadcastTx(decode(payload)?),
            other => {
                return Err(crate::Error::Decode(format!(
                    "unknown command {other:?}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{txid_from_byte, Script};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            inputs: vec![TxIn::from_outpoint(Outpoint::new(txid_from_byte(1), 0))],
            outputs: vec![TxOut::new(10_000, Script::op_return())],
        }
    }

    fn sample_queue() -> Queue {
        Queue {
            denomination: 16,
            coordinator_outpoint: Outpoint::new(txid_from_byte(9), 1),
            time: 1_700_000_000,
            ready: false,
            signature: vec![0xab; 96],
        }
    }

    #[test]
    fn every_payload_round_trips() {
        let messages = vec![
            NetMessage::Accept(Accept {
                denomination: 8,
                collateral: sample_tx(),
            }),
            NetMessage::Queue(sample_queue()),
            NetMessage::StatusUpdate(StatusUpdate {
                session_id: 512,
                state: PoolState::Queue as i32,
                status_update: PoolStatusUpdate::Accepted as i32,
                message_id: PoolMessage::MsgNoErr as i32,
            }),
            NetMessage::Entry(Entry {
                inputs: sample_tx().inputs,
                outputs: sample_tx().outputs,
                collateral: sample_tx(),
            }),
            NetMessage::FinalTransaction(FinalTransaction {
                session_id: 512,
                tx: sample_tx(),
            }),
            NetMessage::SignedInputs(SignedInputs {
                inputs: sample_tx().inputs,
            }),
            NetMessage::Complete(Complete {
                session_id: 512,
                message_id: PoolMessage::MsgSuccess as i32,
            }),
            NetMessage::BroadcastTx(BroadcastTx {
                tx: sample_tx(),
                coordinator_outpoint: Outpoint::new(txid_from_byte(9), 1),
                time: 1_700_000_000,
                signature: vec![0xcd; 96],
            }),
        ];
        for message in messages {
            let back =
                NetMessage::from_payload(message.command(), &message.payload()).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn queue_signature_hash_ignores_signature() {
        let queue = sample_queue();
        let mut resigned = queue.clone();
        resigned.signature = vec![0xff; 96];
        assert_eq!(queue.signature_hash(), resigned.signature_hash());

        let mut other = queue.clone();
        other.ready = true;
        assert_ne!(queue.signature_hash(), other.signature_hash());
    }

    #[test]
    fn queue_time_window() {
        let queue = sample_queue();
        let t = queue.time;
        assert!(!queue.is_time_out_of_bounds(t));
        assert!(!queue.is_time_out_of_bounds(t + COINJOIN_QUEUE_TIMEOUT));
        assert!(queue.is_time_out_of_bounds(t + COINJOIN_QUEUE_TIMEOUT + 1));
        assert!(queue.is_time_out_of_bounds(t - COINJOIN_QUEUE_TIMEOUT - 1));
    }

    #[test]
    fn pool_enums_reject_out_of_range() {
        assert_eq!(PoolState::from_raw(5), None);
        assert_eq!(PoolState::from_raw(-1), None);
        assert_eq!(PoolMessage::from_raw(23), None);
        assert_eq!(PoolMessage::from_raw(22), Some(PoolMessage::ErrSizeMismatch));
        assert_eq!(PoolStatusUpdate::from_raw(2), None);
    }

    #[test]
    fn status_messages_have_stable_text() {
        assert_eq!(StatusMessage::NothingToDo.to_string(), "Nothing to do.");
        assert_eq!(
            StatusMessage::Incomplete(PoolMessage::ErrSession).to_string(),
            "Mixing request incomplete: Session not complete! Will retry..."
        );
    }
}
