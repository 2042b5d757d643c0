//! Core type definitions for the satchel wallet library
//!
//! This module defines fundamental types shared across multiple modules:
//! pool tags, block identifiers, balance kinds and the network policy
//! constants used by fee and dust computation.

use bitcoin::{Amount, BlockHash, Script};

// ============================================================================
// Policy constants
// ============================================================================

/// Depth at which a coinbase output becomes spendable (mainnet rule).
pub const COINBASE_MATURITY: u32 = 100;

/// Depth past which a transaction is considered irreversibly confirmed.
///
/// Once a transaction is this deep, the set of peers that announced it is
/// forgotten: it will never need to be evaluated as an unconfirmed
/// transaction again.
pub const EVENT_HORIZON: u32 = 10;

/// Largest transaction, in bytes, that the wallet will create.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Reference minimum fee rate, in satoshis per 1000 virtual bytes.
///
/// Transactions paying less than this are unlikely to relay.
pub const REFERENCE_MIN_FEE_PER_KB: Amount = Amount::from_sat(1_000);

/// Capacity of the ring buffer holding risk-dropped transactions.
pub const RISK_DROPPED_CAPACITY: usize = 1_000;

/// Maximum number of inputs a single key-rotation batch will consume.
///
/// Bounds the rotation transaction well below [`MAX_STANDARD_TX_SIZE`].
pub const ROTATION_MAX_INPUTS: usize = 600;

/// Default key lookahead maintained past the last issued chain index.
pub const DEFAULT_LOOKAHEAD: u32 = 100;

// ============================================================================
// Pool membership
// ============================================================================

/// The four disjoint pools a tracked transaction can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Confirmed, with at least one owned output still spendable.
    Unspent,
    /// Confirmed, with every owned output spent.
    Spent,
    /// Announced or self-created but not yet in the best chain.
    Pending,
    /// Overridden by a double spend, or a reorganized-out coinbase.
    Dead,
}

impl Pool {
    /// All pools, in the order input connection attempts probe them.
    pub const ALL: [Pool; 4] = [Pool::Unspent, Pool::Spent, Pool::Pending, Pool::Dead];
}

// ============================================================================
// Chain view
// ============================================================================

/// Identifies a block the wallet has been told about.
///
/// The wallet never sees full blocks; the chain collaborator hands it this
/// triple together with the relevant transactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockId {
    /// Hash of the block header.
    pub hash: BlockHash,
    /// Height of the block in its chain.
    pub height: u32,
    /// Header timestamp, seconds since the Unix epoch.
    pub time: u64,
}

/// Whether a block delivering a transaction is on the best chain or a side
/// chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainEventType {
    /// The block extends the current best chain.
    BestChain,
    /// The block is on a presently inactive fork.
    SideChain,
}

// ============================================================================
// Balances
// ============================================================================

/// The two balances a wallet can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceType {
    /// Value the default coin selector would spend right now: confirmed
    /// outputs plus propagated self-originated change.
    Available,
    /// Value the wallet expects to control once every pending transaction
    /// confirms. Always at least [`BalanceType::Available`].
    Estimated,
}

/// Why a transaction was created, carried for display purposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxPurpose {
    /// Origin unknown, typically a network transaction.
    #[default]
    Unknown,
    /// A payment the user asked for.
    UserPayment,
    /// An internal transaction moving funds off rotating keys.
    KeyRotation,
}

// ============================================================================
// Script classification
// ============================================================================

/// Output script shapes the wallet understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    /// Pay-to-pubkey; carries the raw serialized key.
    P2pk(Vec<u8>),
    /// Pay-to-pubkey-hash.
    P2pkh([u8; 20]),
    /// Pay-to-script-hash.
    P2sh([u8; 20]),
    /// Pay-to-witness-pubkey-hash.
    P2wpkh([u8; 20]),
    /// Data carrier output.
    OpReturn,
    /// Anything else; the wallet treats it as not ours.
    Other,
}

/// Classifies an output script into one of the shapes the wallet handles.
pub fn classify_script(script: &Script) -> ScriptKind {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[3..23]);
        ScriptKind::P2pkh(hash)
    } else if script.is_p2sh() {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[2..22]);
        ScriptKind::P2sh(hash)
    } else if script.is_p2wpkh() {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[2..22]);
        ScriptKind::P2wpkh(hash)
    } else if script.is_p2pk() {
        // <push pubkey> OP_CHECKSIG with a 33- or 65-byte key
        let key_len = bytes[0] as usize;
        ScriptKind::P2pk(bytes[1..1 + key_len].to_vec())
    } else if script.is_op_return() {
        ScriptKind::OpReturn
    } else {
        ScriptKind::Other
    }
}

// ============================================================================
// Dust
// ============================================================================

/// Minimum relay fee rate used for the dust threshold, sat per kvB.
const DUST_RELAY_FEE_PER_KB: u64 = 1_000;

/// Bytes it costs to later spend a legacy output (outpoint, scriptSig with
/// signature and key, sequence).
const LEGACY_SPEND_COST: u64 = 148;

/// Virtual bytes it costs to later spend a segwit output; the witness data
/// carries the signature at a quarter weight.
const SEGWIT_SPEND_COST: u64 = 37;

/// Smallest value at which an output paying `script` is worth relaying.
///
/// Below this threshold the cost of spending the output approaches or
/// exceeds its value and the network treats it as dust.
pub fn min_non_dust(script: &Script) -> Amount {
    let serialized = 8 + varint_len(script.len() as u64) + script.len() as u64;
    let spend_cost =
        if script.is_witness_program() { SEGWIT_SPEND_COST } else { LEGACY_SPEND_COST };
    Amount::from_sat(3 * DUST_RELAY_FEE_PER_KB * (serialized + spend_cost) / 1000)
}

/// Whether `value` paid to `script` would be a dust output.
///
/// Data carrier outputs are never dust: they are provably unspendable and
/// carry no value to protect.
pub fn is_dust(value: Amount, script: &Script) -> bool {
    !script.is_op_return() && value < min_non_dust(script)
}

/// Length of the Bitcoin variable-length integer encoding of `n`.
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
