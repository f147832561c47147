//! Minimal transaction model used by the mixing engine.
//!
//! The engine never validates consensus rules; it only needs enough structure
//! to plan outputs, compare inputs/outputs of a coordinator-assembled
//! transaction against its own entries, and hash payloads for signatures.
//! Wallet-side signing and broadcast stay behind the [`Wallet`] trait.
//!
//! [`Wallet`]: crate::wallet::Wallet

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::denom::Amount;
use crate::wire::{SliceReader, WireDecode, WireEncode};
use crate::Result;

// ── Txid ────────────────────────────────────────────────────────────

/// Double-SHA256 of a transaction's wire encoding, internal byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn all_zeros() -> Txid {
        Txid([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Byte order used for display and for canonical input sorting
    /// (big-endian, the reverse of the internal order).
    pub fn to_display_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_display_bytes()))
    }
}

pub(crate) fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

// ── Outpoint ────────────────────────────────────────────────────────

/// Reference to a transaction output: `(txid, output index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: Txid,
    pub index: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, index: u32) -> Outpoint {
        Outpoint { txid, index }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

// ── Script ──────────────────────────────────────────────────────────

const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// An opaque script program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Script {
        Script(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Script {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A provably unspendable data output.
    pub fn op_return() -> Script {
        Script(vec![OP_RETURN])
    }

    pub fn is_op_return(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    /// Standard pay-to-pubkey-hash program.
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Script {
        let mut program = Vec::with_capacity(25);
        program.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
        program.extend_from_slice(pubkey_hash);
        program.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Script(program)
    }

    /// Extract the pubkey hash from a p2pkh program, if that is what this is.
    pub fn p2pkh_hash(&self) -> Option<[u8; 20]> {
        if self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 20
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&self.0[3..23]);
            Some(hash)
        } else {
            None
        }
    }
}

// ── Inputs / outputs ────────────────────────────────────────────────

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_out: Outpoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn from_outpoint(prev_out: Outpoint) -> TxIn {
        TxIn {
            prev_out,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    /// Equality on the outpoint alone, ignoring signatures and sequence.
    ///
    /// Used when matching our submitted inputs against a coordinator-assembled
    /// final transaction, whose copies carry different script signatures.
    pub fn same_outpoint(&self, other: &TxIn) -> bool {
        self.prev_out == other.prev_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Script) -> TxOut {
        TxOut {
            value,
            script_pubkey,
        }
    }
}

// ── Transaction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub lock_time: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn txid(&self) -> Txid {
        let mut buf = Vec::with_capacity(self.encoded_size_hint());
        self.encode_to(&mut buf);
        Txid(double_sha256(&buf))
    }

    fn encoded_size_hint(&self) -> usize {
        16 + self.inputs.len() * 42 + self.outputs.len() * 34
    }

    /// Sort inputs and outputs into the canonical (BIP69-equivalent) order:
    /// inputs by display-order prev hash then index, outputs by value then
    /// script bytes.
    pub fn sort_canonical(&mut self) {
        self.inputs.sort_by(|a, b| {
            (a.prev_out.txid.to_display_bytes(), a.prev_out.index)
                .cmp(&(b.prev_out.txid.to_display_bytes(), b.prev_out.index))
        });
        self.outputs
            .sort_by(|a, b| (a.value, &a.script_pubkey).cmp(&(b.value, &b.script_pubkey)));
    }
}

// ── Wire encoding ───────────────────────────────────────────────────

impl WireEncode for Txid {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl WireDecode for Txid {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Txid> {
        let bytes = r.take(32)?;
        let mut txid = [0u8; 32];
        txid.copy_from_slice(bytes);
        Ok(Txid(txid))
    }
}

impl WireEncode for Outpoint {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.txid.encode_to(out);
        self.index.encode_to(out);
    }
}

impl WireDecode for Outpoint {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Outpoint> {
        Ok(Outpoint {
            txid: Txid::decode_from(r)?,
            index: u32::decode_from(r)?,
        })
    }
}

impl WireEncode for Script {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.0.encode_to(out);
    }
}

impl WireDecode for Script {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Script> {
        Ok(Script(Vec::<u8>::decode_from(r)?))
    }
}

impl WireEncode for TxIn {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.prev_out.encode_to(out);
        self.script_sig.encode_to(out);
        self.sequence.encode_to(out);
    }
}

impl WireDecode for TxIn {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<TxIn> {
        Ok(TxIn {
            prev_out: Outpoint::decode_from(r)?,
            script_sig: Script::decode_from(r)?,
            sequence: u32::decode_from(r)?,
        })
    }
}

impl WireEncode for TxOut {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.value.encode_to(out);
        self.script_pubkey.encode_to(out);
    }
}

impl WireDecode for TxOut {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<TxOut> {
        Ok(TxOut {
            value: Amount::decode_from(r)?,
            script_pubkey: Script::decode_from(r)?,
        })
    }
}

impl WireEncode for Transaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.version.encode_to(out);
        self.inputs.encode_to(out);
        self.outputs.encode_to(out);
        self.lock_time.encode_to(out);
    }
}

impl WireDecode for Transaction {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Transaction> {
        Ok(Transaction {
            version: u16::decode_from(r)?,
            inputs: Vec::<TxIn>::decode_from(r)?,
            outputs: Vec::<TxOut>::decode_from(r)?,
            lock_time: u32::decode_from(r)?,
        })
    }
}

/// Helper for tests and fixtures: a txid with a recognizable byte pattern.
pub fn txid_from_byte(byte: u8) -> Txid {
    Txid([byte; 32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, encode};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            inputs: vec![
                TxIn::from_outpoint(Outpoint::new(txid_from_byte(0xbb), 1)),
                TxIn::from_outpoint(Outpoint::new(txid_from_byte(0xaa), 0)),
            ],
            outputs: vec![
                TxOut::new(50_000, Script::p2pkh(&[2u8; 20])),
                TxOut::new(10_000, Script::p2pkh(&[1u8; 20])),
            ],
        }
    }

    #[test]
    fn txid_changes_with_content() {
        let tx = sample_tx();
        let mut other = tx.clone();
        other.outputs[0].value += 1;
        assert_ne!(tx.txid(), other.txid());
        assert_eq!(tx.txid(), tx.clone().txid());
    }

    #[test]
    fn canonical_sort_orders_inputs_and_outputs() {
        let mut tx = sample_tx();
        tx.sort_canonical();
        assert_eq!(tx.inputs[0].prev_out.txid, txid_from_byte(0xaa));
        assert_eq!(tx.outputs[0].value, 10_000);
        assert_eq!(tx.outputs[1].value, 50_000);
    }

    #[test]
    fn canonical_sort_is_stable_for_equal_values() {
        let mut tx = Transaction::new();
        tx.outputs.push(TxOut::new(10_000, Script::p2pkh(&[9u8; 20])));
        tx.outputs.push(TxOut::new(10_000, Script::p2pkh(&[3u8; 20])));
        tx.sort_canonical();
        assert!(tx.outputs[0].script_pubkey <= tx.outputs[1].script_pubkey);
    }

    #[test]
    fn transaction_round_trips() {
        let tx = sample_tx();
        let bytes = encode(&tx);
        let back: Transaction = decode(&bytes).unwrap();
        assert_eq!(tx, back);
    }

    #[test]
    fn p2pkh_hash_extraction() {
        let script = Script::p2pkh(&[7u8; 20]);
        assert_eq!(script.p2pkh_hash(), Some([7u8; 20]));
        assert_eq!(Script::op_return().p2pkh_hash(), None);
        assert!(Script::op_return().is_op_return());
    }
}
