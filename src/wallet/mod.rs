//! The wallet: owner of the pools, the confidence view and the spend
//! machinery
//!
//! All pool membership and spent-flag mutation happens here, synchronously
//! under the wallet lock, with the key registry behind a nested lock
//! (lock ordering is always wallet → key registry). Listener callbacks
//! are collected while locked and dispatched afterwards, so no user code
//! ever runs with a wallet lock held.
//!
//! # Structure
//!
//! The module is organized by transition family:
//! - `receive`: inbound state machine (pending, block delivery, new best
//!   block, double spends)
//! - `reorg`: chain reorganization replay
//! - `send`: payment completion, fee iteration and the signer chain
//! - `maintenance`: key-rotation sweeps

pub mod maintenance;
pub mod receive;
pub mod reorg;
pub mod send;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use parking_lot::Mutex;
use tracing::info;

use crate::autosave::{Autosave, WalletPersister};
use crate::broadcast::Broadcaster;
use crate::coinselect::{CoinSelector, DefaultCoinSelector, SpendCandidate};
use crate::confidence::{ConfidenceTable, Promise};
use crate::errors::{Error, Result};
use crate::events::{Executor, Listener, ListenerId, ListenerSet, WalletEvent};
use crate::keys::{ChainStructure, KeyChainGroup, ScriptType};
use crate::pool::PoolStore;
use crate::risk::{DefaultRiskAnalyzer, RiskAnalyzer};
use crate::signer::{LocalSigner, ScriptVerifier, StructuralVerifier, TransactionSigner};
use crate::types::{BalanceType, BlockId, Pool, COINBASE_MATURITY};

/// A pending balance-threshold future.
pub(crate) struct BalanceWatcher {
    pub(crate) target: Amount,
    pub(crate) balance_type: BalanceType,
    pub(crate) promise: Promise<Amount>,
}

/// Mutable wallet state guarded by the coarse wallet lock.
pub(crate) struct WalletInner {
    /// Pools, id index, spent index and the risk ring.
    pub(crate) store: PoolStore,
    /// The last best-chain block observed.
    pub(crate) last_seen: Option<BlockId>,
    /// Transactions whose depth was already set by the block that is
    /// about to be announced via `notify_new_best_block`.
    pub(crate) ignore_next_block: HashSet<Txid>,
    /// Whether a reorganization replay is running.
    pub(crate) inside_reorg: bool,
    /// Whether the next best-block notification should force a
    /// synchronous save.
    pub(crate) hard_save_on_next_block: bool,
    /// Outstanding balance futures.
    pub(crate) balance_watchers: Vec<BalanceWatcher>,
}

impl WalletInner {
    fn new() -> Self {
        Self {
            store: PoolStore::new(),
            last_seen: None,
            ignore_next_block: HashSet::new(),
            inside_reorg: false,
            hard_save_on_next_block: false,
            balance_watchers: Vec::new(),
        }
    }
}

/// How a mutator wants the wallet persisted once the lock is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SaveAction {
    Later,
    Now,
}

/// A Bitcoin SPV wallet core.
///
/// Tracks transactions relevant to its key set across the four pools,
/// maintains spent/unspent state through pending broadcast, confirmation,
/// double spends and reorgs, and assembles new payments.
pub struct Wallet {
    network: Network,
    pub(crate) inner: Mutex<WalletInner>,
    pub(crate) keys: Mutex<KeyChainGroup>,
    pub(crate) confidence: ConfidenceTable,
    listeners: ListenerSet,
    pub(crate) risk_analyzer: Mutex<Arc<dyn RiskAnalyzer>>,
    pub(crate) coin_selector: Mutex<Arc<dyn CoinSelector>>,
    pub(crate) signers: Mutex<Vec<Arc<dyn TransactionSigner>>>,
    pub(crate) verifier: Arc<dyn ScriptVerifier>,
    broadcaster: Mutex<Option<Arc<dyn Broadcaster>>>,
    autosave: Mutex<Option<Autosave>>,
    accept_risky: Mutex<bool>,
    pub(crate) key_rotation_time: Mutex<Option<u64>>,
}

impl Wallet {
    /// Creates a wallet around an existing key chain group, sharing the
    /// given confidence table.
    pub fn new(keys: KeyChainGroup, confidence: ConfidenceTable) -> Self {
        let verifier: Arc<dyn ScriptVerifier> = Arc::new(StructuralVerifier);
        let local_signer: Arc<dyn TransactionSigner> =
            Arc::new(LocalSigner::new(verifier.clone()));
        Self {
            network: keys.network(),
            inner: Mutex::new(WalletInner::new()),
            keys: Mutex::new(keys),
            confidence,
            listeners: ListenerSet::new(),
            risk_analyzer: Mutex::new(Arc::new(DefaultRiskAnalyzer)),
            coin_selector: Mutex::new(Arc::new(DefaultCoinSelector)),
            signers: Mutex::new(vec![local_signer]),
            verifier,
            broadcaster: Mutex::new(None),
            autosave: Mutex::new(None),
            accept_risky: Mutex::new(false),
            key_rotation_time: Mutex::new(None),
        }
    }

    /// Creates a wallet from a BIP39 mnemonic.
    pub fn from_mnemonic(
        phrase: &str,
        passphrase: &str,
        network: Network,
        structure: ChainStructure,
        script_type: ScriptType,
        confidence: ConfidenceTable,
    ) -> Result<Self> {
        let keys = KeyChainGroup::from_mnemonic(
            phrase,
            passphrase,
            network,
            structure,
            script_type,
            now_unix(),
        )?;
        Ok(Self::new(keys, confidence))
    }

    /// The network this wallet operates on.
    pub fn network(&self) -> Network { self.network }

    /// The shared confidence table.
    pub fn confidence_table(&self) -> &ConfidenceTable { &self.confidence }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Whether risky pending transactions are committed instead of being
    /// diverted to the risk-dropped ring.
    pub fn set_accept_risky(&self, accept: bool) { *self.accept_risky.lock() = accept; }

    pub(crate) fn accepts_risky(&self) -> bool { *self.accept_risky.lock() }

    /// Replaces the risk analyzer.
    pub fn set_risk_analyzer(&self, analyzer: Arc<dyn RiskAnalyzer>) {
        *self.risk_analyzer.lock() = analyzer;
    }

    /// Replaces the default coin selector.
    pub fn set_coin_selector(&self, selector: Arc<dyn CoinSelector>) {
        *self.coin_selector.lock() = selector;
    }

    /// Appends a signer to the chain, after the built-in local signer.
    pub fn add_signer(&self, signer: Arc<dyn TransactionSigner>) {
        self.signers.lock().push(signer);
    }

    /// Installs the broadcaster used by `send_coins` and maintenance.
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.lock() = Some(broadcaster);
    }

    pub(crate) fn broadcaster(&self) -> Option<Arc<dyn Broadcaster>> {
        self.broadcaster.lock().clone()
    }

    /// Enables background persistence of this wallet to `path`.
    pub fn enable_autosave(
        &self,
        path: impl AsRef<std::path::Path>,
        delay: Duration,
        persister: Arc<dyn WalletPersister>,
    ) {
        *self.autosave.lock() = Some(Autosave::new(path, delay, persister));
    }

    /// Stops background persistence, flushing a pending write.
    pub fn disable_autosave(&self) { *self.autosave.lock() = None; }

    pub(crate) fn apply_save_action(&self, action: SaveAction) {
        let guard = self.autosave.lock();
        if let Some(autosave) = guard.as_ref() {
            match action {
                SaveAction::Later => autosave.save_later(),
                SaveAction::Now =>
                    if let Err(err) = autosave.save_now() {
                        tracing::error!(?err, "synchronous wallet save failed");
                    },
            }
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers an event listener on the given executor.
    pub fn add_listener(&self, executor: Arc<dyn Executor>, listener: Listener) -> ListenerId {
        self.listeners.add(executor, listener)
    }

    /// Removes a listener registration.
    pub fn remove_listener(&self, id: ListenerId) -> bool { self.listeners.remove(id) }

    pub(crate) fn dispatch_events(&self, events: &[WalletEvent]) {
        self.listeners.dispatch_all(events);
    }

    // ------------------------------------------------------------------
    // Key registry passthroughs
    // ------------------------------------------------------------------

    /// The current receive script.
    pub fn current_receive_script(&self) -> Result<ScriptBuf> {
        self.keys.lock().current_receive_script()
    }

    /// Issues a fresh receive script.
    pub fn fresh_receive_script(&self) -> Result<ScriptBuf> {
        let script = self.keys.lock().fresh_receive_script()?;
        self.dispatch_events(&[WalletEvent::CurrentKeyChanged]);
        Ok(script)
    }

    /// The current change script.
    pub fn current_change_script(&self) -> Result<ScriptBuf> {
        self.keys.lock().current_change_script()
    }

    /// Whether the wallet controls `script`.
    pub fn is_mine(&self, script: &bitcoin::Script) -> bool { self.keys.lock().is_mine(script) }

    /// Runs `f` against the key registry (nested lock; never call with
    /// wallet accessors that take the wallet lock from inside `f`).
    pub fn with_keys<R>(&self, f: impl FnOnce(&mut KeyChainGroup) -> R) -> R {
        f(&mut self.keys.lock())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The tracked transaction with this id.
    pub fn get_transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.inner.lock().store.get(txid).map(|wtx| wtx.tx.clone())
    }

    /// The pools containing this id (singleton in steady state).
    pub fn pools_of(&self, txid: &Txid) -> Vec<Pool> { self.inner.lock().store.pools_of(txid) }

    /// The pool containing this id.
    pub fn pool_of(&self, txid: &Txid) -> Option<Pool> { self.inner.lock().store.pool_of(txid) }

    /// Number of transactions in `pool`.
    pub fn pool_size(&self, pool: Pool) -> usize { self.inner.lock().store.len(pool) }

    /// Ids of every tracked transaction, optionally including the dead.
    pub fn transaction_ids(&self, include_dead: bool) -> Vec<Txid> {
        let inner = self.inner.lock();
        let mut ids = Vec::new();
        for pool in Pool::ALL {
            if pool == Pool::Dead && !include_dead {
                continue;
            }
            ids.extend(inner.store.ids_in(pool));
        }
        ids
    }

    /// The last best-chain block the wallet saw.
    pub fn last_seen_block(&self) -> Option<BlockId> { self.inner.lock().last_seen }

    /// Snapshot of the currently spendable owned outpoints.
    pub fn my_unspents(&self) -> Vec<OutPoint> { self.inner.lock().store.my_unspents() }

    /// Number of transactions parked in the risk-dropped ring.
    pub fn risk_dropped_count(&self) -> usize { self.inner.lock().store.risk_dropped_len() }

    /// Whether a coinbase transaction is mature (non-coinbase transactions
    /// always are).
    pub fn is_transaction_mature(&self, txid: &Txid) -> bool {
        let inner = self.inner.lock();
        match inner.store.get(txid) {
            Some(wtx) if wtx.is_coinbase() =>
                self.confidence.depth(txid) >= COINBASE_MATURITY,
            _ => true,
        }
    }

    /// Outpoints the network filter should watch: every output of a
    /// relevant unspent, spent or pending transaction that pays us.
    ///
    /// Returns a snapshot so the caller never holds the wallet lock for
    /// the duration of a filter calculation or block download.
    pub fn watched_outpoints(&self) -> Vec<OutPoint> {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        let mut outpoints = Vec::new();
        for pool in [Pool::Unspent, Pool::Spent, Pool::Pending] {
            for txid in inner.store.ids_in(pool) {
                if let Some(wtx) = inner.store.get(&txid) {
                    for (vout, output) in wtx.tx.output.iter().enumerate() {
                        if keys.is_mine(&output.script_pubkey) {
                            outpoints.push(OutPoint { txid, vout: vout as u32 });
                        }
                    }
                }
            }
        }
        outpoints
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// The balance of the requested type.
    pub fn balance(&self, balance_type: BalanceType) -> Amount {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        self.balance_locked(&inner, &keys, balance_type)
    }

    pub(crate) fn balance_locked(
        &self,
        inner: &WalletInner,
        keys: &KeyChainGroup,
        balance_type: BalanceType,
    ) -> Amount {
        let candidates = self.spend_candidates_locked(inner, keys, true);
        match balance_type {
            BalanceType::Available => {
                let selector = self.coin_selector.lock().clone();
                selector.select(Amount::MAX_MONEY, candidates).total()
            }
            BalanceType::Estimated => candidates.iter().map(|c| c.value).sum(),
        }
    }

    /// A promise completing once the balance of the given type reaches
    /// `target`. Completes immediately if it already has. Never completed
    /// more than once.
    pub fn balance_future(&self, target: Amount, balance_type: BalanceType) -> Promise<Amount> {
        let mut inner = self.inner.lock();
        let keys = self.keys.lock();
        let promise = Promise::new();
        let current = self.balance_locked(&inner, &keys, balance_type);
        if current >= target {
            promise.complete(current);
        } else {
            inner.balance_watchers.push(BalanceWatcher {
                target,
                balance_type,
                promise: promise.clone(),
            });
        }
        promise
    }

    pub(crate) fn check_balance_watchers(&self, inner: &mut WalletInner, keys: &KeyChainGroup) {
        if inner.balance_watchers.is_empty() {
            return;
        }
        let watchers = std::mem::take(&mut inner.balance_watchers);
        for watcher in watchers {
            let current = self.balance_locked(inner, keys, watcher.balance_type);
            if current >= watcher.target {
                watcher.promise.complete(current);
            } else {
                inner.balance_watchers.push(watcher);
            }
        }
    }

    /// All outputs the wallet could contribute to a spend, before coin
    /// selection policy is applied.
    pub fn spend_candidates(&self) -> Vec<SpendCandidate> {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        self.spend_candidates_locked(&inner, &keys, true)
    }

    pub(crate) fn spend_candidates_locked(
        &self,
        inner: &WalletInner,
        keys: &KeyChainGroup,
        exclude_immature: bool,
    ) -> Vec<SpendCandidate> {
        let mut candidates = Vec::new();
        for outpoint in inner.store.my_unspents() {
            let Some(wtx) = inner.store.get(&outpoint.txid) else { continue };
            let Some(output) = wtx.output(outpoint.vout) else { continue };
            let confidence = self.confidence.get(&outpoint.txid);
            if exclude_immature && wtx.is_coinbase() && confidence.depth < COINBASE_MATURITY {
                continue;
            }
            candidates.push(SpendCandidate {
                outpoint,
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                depth: confidence.depth,
                source: confidence.source,
                broadcast_peers: confidence.peer_count(),
                coinbase: wtx.is_coinbase(),
                key_creation_time: keys.key_creation_time_for_script(&output.script_pubkey),
            });
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Ownership helpers shared by the transition modules
    // ------------------------------------------------------------------

    pub(crate) fn value_to_me(keys: &KeyChainGroup, tx: &Transaction) -> Amount {
        tx.output
            .iter()
            .filter(|o| keys.is_mine(&o.script_pubkey))
            .map(|o| o.value)
            .sum()
    }

    pub(crate) fn value_from_me(
        inner: &WalletInner,
        keys: &KeyChainGroup,
        tx: &Transaction,
    ) -> Amount {
        let mut total = Amount::ZERO;
        for input in &tx.input {
            if let Some(output) = inner.store.output_of(&input.previous_output) {
                if keys.is_mine(&output.script_pubkey) {
                    total += output.value;
                }
            }
        }
        total
    }

    pub(crate) fn is_every_owned_output_spent(
        inner: &WalletInner,
        keys: &KeyChainGroup,
        txid: &Txid,
        tx: &Transaction,
    ) -> bool {
        for (vout, output) in tx.output.iter().enumerate() {
            let outpoint = OutPoint { txid: *txid, vout: vout as u32 };
            if keys.is_mine(&output.script_pubkey) && inner.store.index.is_available(&outpoint) {
                return false;
            }
        }
        true
    }

    /// Inserts a transaction into a pool, registering its owned available
    /// outputs as spendable when the pool allows spending from it.
    pub(crate) fn add_wallet_transaction(
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        pool: Pool,
        wtx: crate::pool::WalletTx,
    ) -> Result<()> {
        let txid = wtx.txid();
        let outputs: Vec<TxOut> = wtx.tx.output.clone();
        inner.store.put(pool, wtx)?;
        if pool == Pool::Unspent || pool == Pool::Pending {
            for (vout, output) in outputs.iter().enumerate() {
                let outpoint = OutPoint { txid, vout: vout as u32 };
                if inner.store.index.is_available(&outpoint)
                    && keys.is_mine(&output.script_pubkey)
                {
                    inner.store.index.add_unspent(outpoint);
                }
            }
        }
        Ok(())
    }

    /// Re-homes an already-stored transaction, refreshing the spendable
    /// set the same way `add_wallet_transaction` does.
    pub(crate) fn attach_wallet_transaction(
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        pool: Pool,
        txid: Txid,
    ) -> Result<()> {
        inner.store.attach(txid, pool)?;
        if pool == Pool::Unspent || pool == Pool::Pending {
            let outputs: Vec<TxOut> = match inner.store.get(&txid) {
                Some(wtx) => wtx.tx.output.clone(),
                None => Vec::new(),
            };
            for (vout, output) in outputs.iter().enumerate() {
                let outpoint = OutPoint { txid, vout: vout as u32 };
                if inner.store.index.is_available(&outpoint)
                    && keys.is_mine(&output.script_pubkey)
                {
                    inner.store.index.add_unspent(outpoint);
                }
            }
        }
        Ok(())
    }

    /// Informs the key chains that keys paid by `tx` were observed, so the
    /// lookahead window advances ahead of the network filter.
    pub(crate) fn mark_keys_used(keys: &mut KeyChainGroup, tx: &Transaction) {
        use crate::types::{classify_script, ScriptKind};
        for output in &tx.output {
            match classify_script(&output.script_pubkey) {
                ScriptKind::P2pk(raw) =>
                    if let Ok(pk) = bitcoin::PublicKey::from_slice(&raw) {
                        keys.mark_pubkey_used(&pk);
                    },
                ScriptKind::P2pkh(hash) | ScriptKind::P2wpkh(hash) =>
                    keys.mark_pubkey_hash_used(&hash),
                ScriptKind::P2sh(hash) => keys.mark_script_hash_used(&hash),
                ScriptKind::OpReturn | ScriptKind::Other => {
                    // An output script we don't understand; nothing to mark.
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Whether the wallet's internal invariants hold.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        match Self::is_consistent_or_throw(&inner, &keys) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(%err, "wallet is inconsistent");
                false
            }
        }
    }

    /// Checks every internal invariant, failing with the first violation.
    ///
    /// Run after every mutator; a violation is fatal to the operation that
    /// surfaced it.
    pub(crate) fn is_consistent_or_throw(
        inner: &WalletInner,
        keys: &KeyChainGroup,
    ) -> Result<()> {
        // Pools are disjoint and their union is the id index's domain.
        let mut seen: HashSet<Txid> = HashSet::new();
        let mut pooled = 0usize;
        for pool in Pool::ALL {
            for txid in inner.store.ids_in(pool) {
                pooled += 1;
                if !seen.insert(txid) {
                    return Err(Error::Consistency(format!(
                        "transaction {txid} present in more than one pool"
                    )));
                }
                if inner.store.get(&txid).is_none() {
                    return Err(Error::Consistency(format!(
                        "transaction {txid} pooled but missing from the index"
                    )));
                }
            }
        }
        if pooled != inner.store.total_len() {
            return Err(Error::Consistency(format!(
                "pool sizes sum to {pooled} but the index holds {}",
                inner.store.total_len()
            )));
        }

        // Spent-by back-references point at real inputs citing the outpoint.
        for (outpoint, spender) in inner.store.index.spenders() {
            let Some(wtx) = inner.store.get(&spender.spender) else {
                return Err(Error::Consistency(format!(
                    "outpoint {outpoint} spent by untracked transaction {}",
                    spender.spender
                )));
            };
            match wtx.tx.input.get(spender.index as usize) {
                Some(input) if input.previous_output == *outpoint => {}
                _ =>
                    return Err(Error::Consistency(format!(
                        "spent-by back-reference for {outpoint} does not match its input"
                    ))),
            }
        }

        // UNSPENT transactions have a spendable owned output; SPENT have
        // none.
        for (pool, want_unspent) in [(Pool::Unspent, true), (Pool::Spent, false)] {
            for txid in inner.store.ids_in(pool) {
                let wtx = inner
                    .store
                    .get(&txid)
                    .ok_or_else(|| Error::Consistency(format!("missing tx {txid}")))?;
                let has_spendable = wtx.tx.output.iter().enumerate().any(|(vout, output)| {
                    let outpoint = OutPoint { txid, vout: vout as u32 };
                    keys.is_mine(&output.script_pubkey)
                        && inner.store.index.is_available(&outpoint)
                });
                if has_spendable != want_unspent {
                    return Err(Error::Consistency(format!(
                        "transaction {txid} is misfiled in {pool:?}"
                    )));
                }
            }
        }

        // The spendable set contains only owned, available outputs of
        // spendable-pool parents.
        for outpoint in inner.store.my_unspents() {
            let parent_pool = inner.store.pool_of(&outpoint.txid);
            if !matches!(parent_pool, Some(Pool::Unspent) | Some(Pool::Pending)) {
                return Err(Error::Consistency(format!(
                    "spendable outpoint {outpoint} has parent in {parent_pool:?}"
                )));
            }
            if !inner.store.index.is_available(&outpoint) {
                return Err(Error::Consistency(format!(
                    "spendable outpoint {outpoint} has a recorded spender"
                )));
            }
            match inner.store.output_of(&outpoint) {
                Some(output) if keys.is_mine(&output.script_pubkey) => {}
                _ =>
                    return Err(Error::Consistency(format!(
                        "spendable outpoint {outpoint} is not an owned output"
                    ))),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Forgets every tracked transaction, e.g. before a chain replay.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for txid in inner.store.all_ids() {
            self.confidence.remove(&txid);
        }
        inner.store.clear();
        inner.last_seen = None;
        inner.ignore_next_block.clear();
        info!("wallet reset, all transactions forgotten");
    }
}

/// Current wall-clock time, seconds since the Unix epoch.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
