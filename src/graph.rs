//! Transaction graph primitives
//!
//! Transactions are stored as value objects keyed by txid; inputs carry
//! outpoints only. The "connected output" and "spent by" relations of the
//! transaction graph are resolved through the [`SpentIndex`] rather than by
//! owning pointers, which keeps the graph acyclic and makes reorg replay a
//! matter of rebuilding index entries.

use std::collections::{BTreeSet, HashMap};

use bitcoin::{OutPoint, Txid};

/// Identifies a specific input of a tracked transaction.
///
/// The back half of the "spent by" relation: an output's consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputRef {
    /// The transaction whose input consumes the output.
    pub spender: Txid,
    /// Index of the input within that transaction.
    pub index: u32,
}

/// What to do when connecting an input to an output that is already spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    /// Leave the existing connection in place and report the conflict.
    AbortOnConflict,
    /// Steal the connection: disconnect the previous spender first.
    DisconnectOnConflict,
}

/// Outcome of attempting to connect an input to a tracked output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionResult {
    /// The cited transaction is not tracked in the probed pool.
    NoSuchTx,
    /// The output exists but another input already spends it.
    AlreadySpent,
    /// The connection was recorded.
    Success,
}

/// Index of spent-output back-references and currently spendable outpoints.
///
/// An output is *available* iff it has no entry here; `my_unspents` holds
/// exactly the owned outputs that are available and whose parent sits in the
/// UNSPENT or PENDING pool.
#[derive(Debug, Default)]
pub struct SpentIndex {
    spent_by: HashMap<OutPoint, InputRef>,
    my_unspents: BTreeSet<OutPoint>,
}

impl SpentIndex {
    /// Creates an empty index.
    pub fn new() -> Self { Self::default() }

    /// The input currently spending `outpoint`, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<InputRef> {
        self.spent_by.get(outpoint).copied()
    }

    /// Whether `outpoint` is available for spending (no recorded spender).
    pub fn is_available(&self, outpoint: &OutPoint) -> bool {
        !self.spent_by.contains_key(outpoint)
    }

    /// Records `spender` as the consumer of `outpoint` and drops the
    /// outpoint from the spendable set.
    ///
    /// The caller is responsible for checking availability first; a prior
    /// entry is overwritten (used by disconnect-on-conflict connection).
    pub fn record_spend(&mut self, outpoint: OutPoint, spender: InputRef) {
        self.spent_by.insert(outpoint, spender);
        self.my_unspents.remove(&outpoint);
    }

    /// Removes the spender of `outpoint`, restoring it to the spendable set
    /// when `owned` is true. Returns the disconnected input, if any.
    pub fn disconnect(&mut self, outpoint: &OutPoint, owned: bool) -> Option<InputRef> {
        let prior = self.spent_by.remove(outpoint);
        if owned {
            self.my_unspents.insert(*outpoint);
        }
        prior
    }

    /// Adds an owned, available outpoint to the spendable set.
    ///
    /// Returns false if it was already present.
    pub fn add_unspent(&mut self, outpoint: OutPoint) -> bool { self.my_unspents.insert(outpoint) }

    /// Drops an outpoint from the spendable set without recording a spender
    /// (used when a parent transaction dies or leaves the spendable pools).
    ///
    /// Returns true if it was present.
    pub fn remove_unspent(&mut self, outpoint: &OutPoint) -> bool {
        self.my_unspents.remove(outpoint)
    }

    /// Whether the spendable set contains `outpoint`.
    pub fn contains_unspent(&self, outpoint: &OutPoint) -> bool {
        self.my_unspents.contains(outpoint)
    }

    /// Snapshot of the currently spendable owned outpoints.
    pub fn my_unspents(&self) -> Vec<OutPoint> { self.my_unspents.iter().copied().collect() }

    /// Number of currently spendable owned outpoints.
    pub fn unspent_count(&self) -> usize { self.my_unspents.len() }

    /// Every recorded (outpoint, spender) pair, for consistency checking.
    pub fn spenders(&self) -> impl Iterator<Item = (&OutPoint, &InputRef)> { self.spent_by.iter() }

    /// Clears the whole index.
    pub fn clear(&mut self) {
        self.spent_by.clear();
        self.my_unspents.clear();
    }
}
