//! The four-pool transaction store
//!
//! Every tracked transaction lives in exactly one of the UNSPENT, SPENT,
//! PENDING or DEAD pools. The store owns the transaction value objects in a
//! single id-keyed index; the pools themselves are id sets, so moving a
//! transaction between pools never copies it. A bounded ring of
//! risk-dropped transactions is kept to the side so re-announcements of a
//! rejected transaction can be recognized cheaply.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bitcoin::{Amount, BlockHash, OutPoint, Transaction, TxOut, Txid};

use crate::errors::{Error, Result};
use crate::graph::SpentIndex;
use crate::types::{Pool, TxPurpose, RISK_DROPPED_CAPACITY};

/// A tracked transaction with its wallet-side metadata.
#[derive(Clone, Debug)]
pub struct WalletTx {
    txid: Txid,
    /// The transaction itself; immutable once committed.
    pub tx: Transaction,
    /// When the wallet last learned something about this transaction,
    /// seconds since the Unix epoch.
    pub update_time: Option<u64>,
    /// Blocks the transaction appeared in, with its in-block offset.
    ///
    /// A transaction can appear in several blocks across competing forks.
    pub appearances: BTreeMap<BlockHash, u32>,
    /// Why the transaction was created, if the wallet made it.
    pub purpose: TxPurpose,
}

impl WalletTx {
    /// Wraps a transaction for tracking.
    pub fn new(tx: Transaction) -> Self {
        Self {
            txid: tx.compute_txid(),
            tx,
            update_time: None,
            appearances: BTreeMap::new(),
            purpose: TxPurpose::default(),
        }
    }

    /// The transaction id (cached; computed over the non-witness
    /// serialization).
    pub fn txid(&self) -> Txid { self.txid }

    /// Whether this is a coinbase transaction.
    pub fn is_coinbase(&self) -> bool { self.tx.is_coinbase() }

    /// The output at `vout`, if it exists.
    pub fn output(&self, vout: u32) -> Option<&TxOut> { self.tx.output.get(vout as usize) }

    /// Value of the output at `vout`, if it exists.
    pub fn output_value(&self, vout: u32) -> Option<Amount> {
        self.output(vout).map(|o| o.value)
    }

    /// Records an appearance in `block` at `offset`.
    pub fn record_appearance(&mut self, block: BlockHash, offset: u32) {
        self.appearances.insert(block, offset);
    }
}

/// The pool store: id→tx index, four disjoint pools, the spent index and
/// the risk-dropped ring.
#[derive(Default)]
pub struct PoolStore {
    txs: HashMap<Txid, WalletTx>,
    unspent: HashSet<Txid>,
    spent: HashSet<Txid>,
    pending: HashSet<Txid>,
    dead: HashSet<Txid>,
    /// Spent-by back-references and the spendable outpoint set.
    pub index: SpentIndex,
    risk_order: VecDeque<Txid>,
    risk_dropped: HashMap<Txid, Transaction>,
}

impl PoolStore {
    /// Creates an empty store.
    pub fn new() -> Self { Self::default() }

    fn pool_set(&self, pool: Pool) -> &HashSet<Txid> {
        match pool {
            Pool::Unspent => &self.unspent,
            Pool::Spent => &self.spent,
            Pool::Pending => &self.pending,
            Pool::Dead => &self.dead,
        }
    }

    fn pool_set_mut(&mut self, pool: Pool) -> &mut HashSet<Txid> {
        match pool {
            Pool::Unspent => &mut self.unspent,
            Pool::Spent => &mut self.spent,
            Pool::Pending => &mut self.pending,
            Pool::Dead => &mut self.dead,
        }
    }

    /// Inserts `wtx` into `pool`.
    ///
    /// Inserting an id that is already tracked in a different pool is a
    /// consistency violation. Re-inserting into the same pool replaces the
    /// stored value (used when a canonical object gains metadata).
    pub fn put(&mut self, pool: Pool, wtx: WalletTx) -> Result<()> {
        let txid = wtx.txid();
        for other in Pool::ALL {
            if other != pool && self.pool_set(other).contains(&txid) {
                return Err(Error::Consistency(format!(
                    "transaction {txid} already tracked in {other:?}, refusing insert into {pool:?}"
                )));
            }
        }
        self.txs.insert(txid, wtx);
        self.pool_set_mut(pool).insert(txid);
        Ok(())
    }

    /// Moves `txid` from one pool to another, atomically with respect to
    /// the wallet lock the caller holds.
    pub fn move_to(&mut self, txid: Txid, from: Pool, to: Pool) -> Result<()> {
        if !self.pool_set_mut(from).remove(&txid) {
            return Err(Error::Consistency(format!(
                "transaction {txid} not in {from:?}, cannot move to {to:?}"
            )));
        }
        self.pool_set_mut(to).insert(txid);
        Ok(())
    }

    /// Removes `txid` from `pool` but keeps the transaction in the index.
    ///
    /// The caller must re-home the transaction before the operation
    /// completes; the index and pools only diverge inside a mutator.
    pub fn detach(&mut self, txid: &Txid, pool: Pool) -> bool {
        self.pool_set_mut(pool).remove(txid)
    }

    /// Re-homes an already-stored transaction into `pool`.
    ///
    /// Counterpart of [`PoolStore::detach`]; fails if the id is unknown or
    /// currently sits in a different pool.
    pub fn attach(&mut self, txid: Txid, pool: Pool) -> Result<()> {
        if !self.txs.contains_key(&txid) {
            return Err(Error::Consistency(format!(
                "transaction {txid} is not tracked, cannot attach to {pool:?}"
            )));
        }
        for other in Pool::ALL {
            if other != pool && self.pool_set(other).contains(&txid) {
                return Err(Error::Consistency(format!(
                    "transaction {txid} already tracked in {other:?}, refusing attach to {pool:?}"
                )));
            }
        }
        self.pool_set_mut(pool).insert(txid);
        Ok(())
    }

    /// Removes `txid` entirely: from its pool and from the index.
    pub fn remove(&mut self, txid: &Txid) -> Option<WalletTx> {
        for pool in Pool::ALL {
            self.pool_set_mut(pool).remove(txid);
        }
        self.txs.remove(txid)
    }

    /// The tracked transaction with this id, from any pool.
    pub fn get(&self, txid: &Txid) -> Option<&WalletTx> { self.txs.get(txid) }

    /// Mutable access to a tracked transaction's metadata.
    pub fn get_mut(&mut self, txid: &Txid) -> Option<&mut WalletTx> { self.txs.get_mut(txid) }

    /// Whether any pool tracks this id.
    pub fn contains(&self, txid: &Txid) -> bool { self.txs.contains_key(txid) }

    /// Whether `pool` contains this id.
    pub fn in_pool(&self, txid: &Txid, pool: Pool) -> bool { self.pool_set(pool).contains(txid) }

    /// The pools containing this id.
    ///
    /// A singleton in steady state; multiple entries can only be observed
    /// in the middle of a mutator and indicate a bug if seen outside one.
    pub fn pools_of(&self, txid: &Txid) -> Vec<Pool> {
        Pool::ALL.iter().copied().filter(|p| self.pool_set(*p).contains(txid)).collect()
    }

    /// The single pool containing this id, if tracked.
    pub fn pool_of(&self, txid: &Txid) -> Option<Pool> {
        Pool::ALL.iter().copied().find(|p| self.pool_set(*p).contains(txid))
    }

    /// Ids in `pool`, in no particular order.
    pub fn ids_in(&self, pool: Pool) -> Vec<Txid> { self.pool_set(pool).iter().copied().collect() }

    /// Number of transactions in `pool`.
    pub fn len(&self, pool: Pool) -> usize { self.pool_set(pool).len() }

    /// Total number of tracked transactions.
    pub fn total_len(&self) -> usize { self.txs.len() }

    /// Whether the store tracks nothing.
    pub fn is_empty(&self) -> bool { self.txs.is_empty() }

    /// All tracked ids.
    pub fn all_ids(&self) -> Vec<Txid> { self.txs.keys().copied().collect() }

    /// The output a tracked transaction's outpoint refers to.
    pub fn output_of(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txs.get(&outpoint.txid).and_then(|wtx| wtx.output(outpoint.vout))
    }

    /// Snapshot of the currently spendable owned outpoints.
    pub fn my_unspents(&self) -> Vec<OutPoint> { self.index.my_unspents() }

    /// Clears everything, including the risk-dropped ring.
    pub fn clear(&mut self) {
        self.txs.clear();
        for pool in Pool::ALL {
            self.pool_set_mut(pool).clear();
        }
        self.index.clear();
        self.risk_order.clear();
        self.risk_dropped.clear();
    }

    // ------------------------------------------------------------------
    // Risk-dropped ring
    // ------------------------------------------------------------------

    /// Parks a risky transaction in the bounded ring, evicting the eldest
    /// entry once the ring is full.
    pub fn push_risk_dropped(&mut self, tx: Transaction) {
        let txid = tx.compute_txid();
        if self.risk_dropped.insert(txid, tx).is_none() {
            self.risk_order.push_back(txid);
        }
        while self.risk_order.len() > RISK_DROPPED_CAPACITY {
            if let Some(evicted) = self.risk_order.pop_front() {
                self.risk_dropped.remove(&evicted);
            }
        }
    }

    /// Whether the ring holds this id.
    pub fn risk_dropped_contains(&self, txid: &Txid) -> bool {
        self.risk_dropped.contains_key(txid)
    }

    /// Removes and returns a parked transaction, e.g. because it confirmed
    /// despite our risk verdict.
    pub fn take_risk_dropped(&mut self, txid: &Txid) -> Option<Transaction> {
        let tx = self.risk_dropped.remove(txid);
        if tx.is_some() {
            self.risk_order.retain(|id| id != txid);
        }
        tx
    }

    /// Number of transactions parked in the ring.
    pub fn risk_dropped_len(&self) -> usize { self.risk_order.len() }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, Sequence, TxIn, Witness};

    use super::*;

    fn dummy_tx(lock_time: u32) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(lock_time),
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([9u8; 32]),
                    vout: lock_time,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn test_put_and_get() {
        let mut store = PoolStore::new();
        let wtx = WalletTx::new(dummy_tx(0));
        let txid = wtx.txid();

        store.put(Pool::Pending, wtx).expect("insert should succeed");

        assert!(store.contains(&txid));
        assert_eq!(store.pool_of(&txid), Some(Pool::Pending));
        assert_eq!(store.pools_of(&txid), vec![Pool::Pending]);
    }

    #[test]
    fn test_put_rejects_cross_pool_duplicate() {
        let mut store = PoolStore::new();
        let wtx = WalletTx::new(dummy_tx(0));
        let dup = wtx.clone();

        store.put(Pool::Pending, wtx).expect("insert should succeed");
        let err = store.put(Pool::Unspent, dup).expect_err("cross-pool insert should fail");

        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_move_between_pools() {
        let mut store = PoolStore::new();
        let wtx = WalletTx::new(dummy_tx(0));
        let txid = wtx.txid();
        store.put(Pool::Pending, wtx).expect("insert should succeed");

        store.move_to(txid, Pool::Pending, Pool::Unspent).expect("move should succeed");

        assert_eq!(store.pool_of(&txid), Some(Pool::Unspent));
        assert_eq!(store.len(Pool::Pending), 0);
        assert_eq!(store.len(Pool::Unspent), 1);
    }

    #[test]
    fn test_move_from_wrong_pool_fails() {
        let mut store = PoolStore::new();
        let wtx = WalletTx::new(dummy_tx(0));
        let txid = wtx.txid();
        store.put(Pool::Pending, wtx).expect("insert should succeed");

        let err = store.move_to(txid, Pool::Spent, Pool::Dead).expect_err("wrong pool");
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_remove_clears_all_pools() {
        let mut store = PoolStore::new();
        let wtx = WalletTx::new(dummy_tx(0));
        let txid = wtx.txid();
        store.put(Pool::Dead, wtx).expect("insert should succeed");

        let removed = store.remove(&txid);

        assert!(removed.is_some());
        assert!(!store.contains(&txid));
        assert_eq!(store.len(Pool::Dead), 0);
    }

    #[test]
    fn test_risk_ring_eviction() {
        let mut store = PoolStore::new();
        let first = dummy_tx(0);
        let first_id = first.compute_txid();
        store.push_risk_dropped(first);
        for i in 1..=RISK_DROPPED_CAPACITY as u32 {
            store.push_risk_dropped(dummy_tx(i));
        }

        assert_eq!(store.risk_dropped_len(), RISK_DROPPED_CAPACITY);
        assert!(!store.risk_dropped_contains(&first_id));
    }
}
