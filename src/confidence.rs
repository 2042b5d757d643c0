//! Per-transaction confidence tracking
//!
//! A transaction's confidence is the wallet's belief about its standing:
//! pending in the mempool, building under the best chain at some depth,
//! dead because a double spend overrode it, or in conflict with another
//! pending transaction. Confidence records live in a [`ConfidenceTable`]
//! shared by every wallet attached to the same chain context, so two
//! wallets observing the same transaction agree about its state.
//!
//! The table is handed to the wallet at construction as an explicit
//! context object; there is no hidden process-wide singleton.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use parking_lot::{Condvar, Mutex};

use crate::types::EVENT_HORIZON;

// ============================================================================
// Completion promises
// ============================================================================

/// A one-shot completion handle.
///
/// Completes at most once; later completions are ignored. Waiters block on
/// a condvar, so a promise must never be awaited while holding the wallet
/// lock.
#[derive(Clone)]
pub struct Promise<T: Clone> {
    shared: Arc<PromiseShared<T>>,
}

struct PromiseShared<T> {
    state: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone> Promise<T> {
    /// Creates an incomplete promise.
    pub fn new() -> Self {
        Self { shared: Arc::new(PromiseShared { state: Mutex::new(None), cv: Condvar::new() }) }
    }

    /// Completes the promise. Returns false if it was already complete.
    pub fn complete(&self, value: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(value);
        self.shared.cv.notify_all();
        true
    }

    /// The completed value, if any.
    pub fn get(&self) -> Option<T> { self.shared.state.lock().clone() }

    /// Whether the promise has completed.
    pub fn is_complete(&self) -> bool { self.shared.state.lock().is_some() }

    /// Blocks until the promise completes.
    pub fn wait(&self) -> T {
        let mut state = self.shared.state.lock();
        while state.is_none() {
            self.shared.cv.wait(&mut state);
        }
        state.clone().expect("promise state present after wait")
    }

    /// Blocks until the promise completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.shared.state.lock();
        if state.is_none() {
            self.shared.cv.wait_for(&mut state, timeout);
        }
        state.clone()
    }
}

// ============================================================================
// Confidence records
// ============================================================================

/// Coarse confidence classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfidenceKind {
    /// Nothing is known yet.
    #[default]
    Unknown,
    /// Seen unconfirmed; expected to be mined eventually.
    Pending,
    /// Included in the best chain at some depth.
    Building,
    /// Overridden by a double spend, or a reorganized-out coinbase.
    Dead,
    /// Double-spent by another pending transaction; miner arbitration will
    /// decide the winner.
    InConflict,
}

/// Where the wallet first learned of a transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// Unspecified origin, typically loaded from disk.
    #[default]
    Unknown,
    /// Announced by a network peer.
    Network,
    /// Created by this wallet; its change is trusted before confirmation.
    Own,
}

/// Snapshot of a transaction's confidence.
#[derive(Clone, Debug, Default)]
pub struct Confidence {
    /// Coarse classification.
    pub kind: ConfidenceKind,
    /// Height of the best-chain block the transaction appeared in.
    pub appeared_at_height: Option<u32>,
    /// Number of best-chain blocks from the appearance block to the tip,
    /// inclusive; 1 means newly confirmed. Zero unless building.
    pub depth: u32,
    /// The transaction that double-spent this one, when dead.
    pub overriding_txid: Option<Txid>,
    /// Origin of the transaction.
    pub source: Source,
    /// Peers that have announced the transaction.
    pub broadcast_peers: BTreeSet<SocketAddr>,
}

impl Confidence {
    /// Number of distinct peers that announced the transaction.
    pub fn peer_count(&self) -> usize { self.broadcast_peers.len() }
}

#[derive(Default)]
struct ConfidenceEntry {
    confidence: Confidence,
    depth_watchers: Vec<(u32, Promise<u32>)>,
}

impl ConfidenceEntry {
    fn fire_depth_watchers(&mut self) {
        let depth = self.confidence.depth;
        self.depth_watchers.retain(|(target, promise)| {
            if depth >= *target {
                promise.complete(depth);
                false
            } else {
                true
            }
        });
    }
}

// ============================================================================
// Confidence table
// ============================================================================

/// Shared, internally synchronized table of confidence records keyed by
/// txid.
///
/// Cloning the table shares the underlying storage.
#[derive(Clone, Default)]
pub struct ConfidenceTable {
    inner: Arc<Mutex<HashMap<Txid, ConfidenceEntry>>>,
}

impl ConfidenceTable {
    /// Creates an empty table.
    pub fn new() -> Self { Self::default() }

    /// Snapshot of the record for `txid`; a default record if never seen.
    pub fn get(&self, txid: &Txid) -> Confidence {
        self.inner.lock().get(txid).map(|e| e.confidence.clone()).unwrap_or_default()
    }

    /// Coarse classification for `txid`.
    pub fn kind(&self, txid: &Txid) -> ConfidenceKind {
        self.inner.lock().get(txid).map(|e| e.confidence.kind).unwrap_or_default()
    }

    /// Building depth for `txid`; zero unless building.
    pub fn depth(&self, txid: &Txid) -> u32 {
        self.inner.lock().get(txid).map(|e| e.confidence.depth).unwrap_or(0)
    }

    /// Origin recorded for `txid`.
    pub fn source(&self, txid: &Txid) -> Source {
        self.inner.lock().get(txid).map(|e| e.confidence.source).unwrap_or_default()
    }

    /// Records where the transaction came from.
    pub fn set_source(&self, txid: Txid, source: Source) {
        let mut inner = self.inner.lock();
        inner.entry(txid).or_default().confidence.source = source;
    }

    /// Moves the record to PENDING, wiping chain placement data.
    ///
    /// The broadcast-peer set is deliberately retained: after a reorg the
    /// transaction is expected to confirm again and should not read as
    /// never-seen.
    pub fn set_pending(&self, txid: Txid) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        entry.confidence.kind = ConfidenceKind::Pending;
        entry.confidence.appeared_at_height = None;
        entry.confidence.depth = 0;
        entry.confidence.overriding_txid = None;
    }

    /// Moves the record to IN_CONFLICT, keeping chain placement untouched.
    pub fn set_in_conflict(&self, txid: Txid) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        entry.confidence.kind = ConfidenceKind::InConflict;
        entry.confidence.overriding_txid = None;
    }

    /// Moves the record to DEAD, recording the overriding transaction when
    /// there is one (a reorganized-out coinbase has none).
    pub fn mark_dead(&self, txid: Txid, overriding: Option<Txid>) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        entry.confidence.kind = ConfidenceKind::Dead;
        entry.confidence.appeared_at_height = None;
        entry.confidence.depth = 0;
        entry.confidence.overriding_txid = overriding;
    }

    /// Moves the record to BUILDING at depth 1, anchored at `height`.
    pub fn mark_building(&self, txid: Txid, height: u32) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        entry.confidence.kind = ConfidenceKind::Building;
        entry.confidence.appeared_at_height = Some(height);
        entry.confidence.depth = 1;
        entry.confidence.overriding_txid = None;
        entry.fire_depth_watchers();
    }

    /// Adds one confirmation to a building record; returns the new depth.
    ///
    /// Past the event horizon the broadcast-peer set is erased, since the
    /// transaction is unlikely to ever go pending again.
    pub fn increment_depth(&self, txid: Txid) -> u32 {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        entry.confidence.depth += 1;
        if entry.confidence.depth > EVENT_HORIZON {
            entry.confidence.broadcast_peers.clear();
        }
        entry.fire_depth_watchers();
        entry.confidence.depth
    }

    /// Removes `blocks` confirmations from a building record (reorg).
    pub fn subtract_depth(&self, txid: Txid, blocks: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&txid) {
            entry.confidence.depth = entry.confidence.depth.saturating_sub(blocks);
        }
    }

    /// Records that `peer` announced the transaction. Returns true when the
    /// peer was not already known. An UNKNOWN source becomes NETWORK.
    pub fn mark_broadcast_by(&self, txid: Txid, peer: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        let fresh = entry.confidence.broadcast_peers.insert(peer);
        if entry.confidence.source == Source::Unknown {
            entry.confidence.source = Source::Network;
        }
        fresh
    }

    /// Number of peers that announced the transaction.
    pub fn peer_count(&self, txid: &Txid) -> usize {
        self.inner.lock().get(txid).map(|e| e.confidence.peer_count()).unwrap_or(0)
    }

    /// A promise completing when the transaction reaches `target` depth.
    ///
    /// Completes immediately if the depth has already been reached. The
    /// promise completes at most once and is never cancelled.
    pub fn depth_future(&self, txid: Txid, target: u32) -> Promise<u32> {
        let promise = Promise::new();
        let mut inner = self.inner.lock();
        let entry = inner.entry(txid).or_default();
        if entry.confidence.kind == ConfidenceKind::Building && entry.confidence.depth >= target {
            promise.complete(entry.confidence.depth);
        } else {
            entry.depth_watchers.push((target, promise.clone()));
        }
        promise
    }

    /// Drops the record for `txid` (wallet reset).
    pub fn remove(&self, txid: &Txid) { self.inner.lock().remove(txid); }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    fn txid(byte: u8) -> Txid { Txid::from_byte_array([byte; 32]) }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_unknown_by_default() {
        let table = ConfidenceTable::new();
        assert_eq!(table.kind(&txid(1)), ConfidenceKind::Unknown);
        assert_eq!(table.depth(&txid(1)), 0);
    }

    #[test]
    fn test_building_depth_progression() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        table.mark_building(id, 10);
        assert_eq!(table.depth(&id), 1);
        assert_eq!(table.increment_depth(id), 2);
        table.subtract_depth(id, 2);
        assert_eq!(table.depth(&id), 0);
    }

    #[test]
    fn test_event_horizon_clears_peers() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        table.mark_broadcast_by(id, peer(8333));
        table.mark_building(id, 1);
        for _ in 0..EVENT_HORIZON {
            table.increment_depth(id);
        }
        assert_eq!(table.peer_count(&id), 0);
    }

    #[test]
    fn test_mark_dead_records_overrider() {
        let table = ConfidenceTable::new();
        table.mark_dead(txid(1), Some(txid(2)));
        let record = table.get(&txid(1));
        assert_eq!(record.kind, ConfidenceKind::Dead);
        assert_eq!(record.overriding_txid, Some(txid(2)));
    }

    #[test]
    fn test_set_pending_keeps_peers() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        table.mark_broadcast_by(id, peer(8333));
        table.mark_building(id, 5);
        table.set_pending(id);
        let record = table.get(&id);
        assert_eq!(record.kind, ConfidenceKind::Pending);
        assert_eq!(record.depth, 0);
        assert_eq!(record.peer_count(), 1);
    }

    #[test]
    fn test_broadcast_source_promotion() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        assert!(table.mark_broadcast_by(id, peer(1)));
        assert!(!table.mark_broadcast_by(id, peer(1)));
        assert_eq!(table.source(&id), Source::Network);

        let own = txid(2);
        table.set_source(own, Source::Own);
        table.mark_broadcast_by(own, peer(1));
        assert_eq!(table.source(&own), Source::Own);
    }

    #[test]
    fn test_depth_future_completes_on_reach() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        let future = table.depth_future(id, 2);
        assert!(!future.is_complete());

        table.mark_building(id, 1);
        assert!(!future.is_complete());

        table.increment_depth(id);
        assert_eq!(future.get(), Some(2));
    }

    #[test]
    fn test_depth_future_precompleted() {
        let table = ConfidenceTable::new();
        let id = txid(1);
        table.mark_building(id, 1);
        let future = table.depth_future(id, 1);
        assert_eq!(future.get(), Some(1));
    }

    #[test]
    fn test_promise_completes_once() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.complete(1));
        assert!(!promise.complete(2));
        assert_eq!(promise.wait(), 1);
        assert_eq!(promise.wait_timeout(Duration::from_millis(1)), Some(1));
    }
}
