//! Inbound state machine
//!
//! The only mutators of pool membership and spent flags live here:
//! `receive_pending` (classifier entry), `commit`, `receive_from_block`,
//! `notify_new_best_block`, plus the double-spend kill path. Everything
//! runs synchronously under the wallet lock; events are staged and
//! dispatched after it is released.

use std::collections::HashSet;

use bitcoin::{OutPoint, Transaction, Txid};
use tracing::{debug, info, warn};

use super::{now_unix, SaveAction, Wallet, WalletInner};
use crate::confidence::{ConfidenceKind, Source};
use crate::errors::{Error, Result};
use crate::events::WalletEvent;
use crate::graph::{ConnectMode, ConnectionResult, InputRef};
use crate::keys::KeyChainGroup;
use crate::pool::WalletTx;
use crate::risk::RiskContext;
use crate::types::{BalanceType, BlockId, ChainEventType, Pool, TxPurpose};

impl Wallet {
    // ------------------------------------------------------------------
    // Classifier
    // ------------------------------------------------------------------

    /// Whether an announced transaction deserves download and processing:
    /// it pays us, spends us, or double-spends something we track. Pure
    /// query; ignores transactions we already know.
    pub fn is_pending_relevant(&self, tx: &Transaction) -> bool {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        if !inner.store.pools_of(&tx.compute_txid()).is_empty() {
            debug!(txid = %tx.compute_txid(), "already tracked, not pending-relevant");
            return false;
        }
        Self::is_relevant_locked(&inner, &keys, tx)
    }

    /// Whether `tx` touches this wallet at all.
    pub fn is_transaction_relevant(&self, tx: &Transaction) -> bool {
        let inner = self.inner.lock();
        let keys = self.keys.lock();
        Self::is_relevant_locked(&inner, &keys, tx)
    }

    fn is_relevant_locked(inner: &WalletInner, keys: &KeyChainGroup, tx: &Transaction) -> bool {
        Self::value_to_me(keys, tx) > bitcoin::Amount::ZERO
            || Self::value_from_me(inner, keys, tx) > bitcoin::Amount::ZERO
            || !Self::find_double_spends(inner, &tx.compute_txid(), tx, None).is_empty()
    }

    /// Whether the risk analyzer would reject `tx`, independent of the
    /// accept-risky setting.
    pub fn is_transaction_risky(&self, tx: &Transaction, dependencies: &[Transaction]) -> bool {
        let context = {
            let inner = self.inner.lock();
            RiskContext { height: inner.last_seen.map(|b| b.height), time: now_unix() }
        };
        let analyzer = self.risk_analyzer.lock().clone();
        let outcome = analyzer.analyze(tx, dependencies, &context);
        if let crate::risk::RiskOutcome::Risky(reason) = outcome {
            warn!(txid = %tx.compute_txid(), %reason, "pending transaction considered risky");
            return true;
        }
        false
    }

    /// Accepts a relevant unconfirmed transaction.
    ///
    /// Idempotent: a transaction already tracked in any pool is ignored.
    /// Relevance is re-checked under the lock since dependencies may have
    /// arrived concurrently; risky transactions divert to the bounded ring
    /// unless the wallet accepts them. The transaction is cloned before
    /// commit so wallets never share a tracked object.
    pub fn receive_pending(
        &self,
        tx: &Transaction,
        dependencies: &[Transaction],
    ) -> Result<()> {
        let txid = tx.compute_txid();
        {
            let inner = self.inner.lock();
            if !inner.store.pools_of(&txid).is_empty() {
                debug!(%txid, "received tx we already saw in a block or created ourselves");
                return Ok(());
            }
        }
        if !self.is_pending_relevant(tx) {
            debug!(%txid, "received tx that isn't relevant to this wallet, discarding");
            return Ok(());
        }
        if self.is_transaction_risky(tx, dependencies) && !self.accepts_risky() {
            let mut inner = self.inner.lock();
            inner.store.push_risk_dropped(tx.clone());
            warn!(
                count = inner.store.risk_dropped_len(),
                "risk dropped transactions being kept in memory"
            );
            return Ok(());
        }
        if self.confidence.source(&txid) == Source::Unknown {
            self.confidence.set_source(txid, Source::Network);
        }
        let value_to_me = {
            let keys = self.keys.lock();
            Self::value_to_me(&keys, tx)
        };
        info!(%txid, %value_to_me, "received a pending transaction");
        // Idempotent by design: a concurrent delivery of the same
        // transaction must not fail the second caller.
        self.maybe_commit(tx.clone())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Records a transaction in the pending pool, updating spent flags and
    /// notifying listeners.
    ///
    /// # Errors
    /// [`Error::AlreadyPending`] if the transaction was committed before.
    pub fn commit(&self, tx: Transaction) -> Result<()> {
        let txid = tx.compute_txid();
        if self.maybe_commit(tx)? {
            Ok(())
        } else {
            Err(Error::AlreadyPending(txid))
        }
    }

    /// Like [`Wallet::commit`] but returns `false` instead of failing when
    /// the transaction is already pending.
    pub fn maybe_commit(&self, tx: Transaction) -> Result<bool> {
        self.maybe_commit_with_purpose(tx, TxPurpose::Unknown)
    }

    pub(crate) fn maybe_commit_with_purpose(
        &self,
        tx: Transaction,
        purpose: TxPurpose,
    ) -> Result<bool> {
        let mut events = Vec::new();
        let committed = {
            let mut inner = self.inner.lock();
            let mut keys = self.keys.lock();
            self.commit_locked(&mut inner, &mut keys, &mut events, tx, purpose)?
        };
        if committed {
            self.dispatch_events(&events);
            self.apply_save_action(SaveAction::Now);
        }
        Ok(committed)
    }

    pub(crate) fn commit_locked(
        &self,
        inner: &mut WalletInner,
        keys: &mut KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        tx: Transaction,
        purpose: TxPurpose,
    ) -> Result<bool> {
        let txid = tx.compute_txid();
        if inner.store.in_pool(&txid, Pool::Pending) {
            return Ok(false);
        }
        info!(%txid, "commit");
        let prev_balance = self.balance_locked(inner, keys, BalanceType::Estimated);
        let value_to_me = Self::value_to_me(keys, &tx);

        // Mark the outputs we are spending so future spends skip them.
        self.update_for_spends(inner, keys, txid, &tx, false)?;
        let value_from_me = Self::value_from_me(inner, keys, &tx);

        let ds_pending = Self::find_double_spends(inner, &txid, &tx, Some(Pool::Pending));
        let ds_unspent = Self::find_double_spends(inner, &txid, &tx, Some(Pool::Unspent));
        let ds_spent = Self::find_double_spends(inner, &txid, &tx, Some(Pool::Spent));
        let spends_dead = self.spends_confidence(inner, &tx, ConfidenceKind::Dead);
        let spends_conflict = self.spends_confidence(inner, &tx, ConfidenceKind::InConflict);

        let mut wtx = WalletTx::new(tx.clone());
        wtx.update_time = Some(now_unix());
        wtx.purpose = purpose;

        if !ds_unspent.is_empty() || !ds_spent.is_empty() || spends_dead {
            // Double spend against the best chain, or built on a dead
            // transaction: the chain wins.
            let overriding = ds_unspent
                .iter()
                .chain(ds_spent.iter())
                .next()
                .copied();
            info!(%txid, ?overriding, "commit -> dead");
            self.confidence.mark_dead(txid, overriding);
            events.push(WalletEvent::ConfidenceChanged(txid));
            Self::add_wallet_transaction(inner, keys, Pool::Dead, wtx)?;
        } else if !ds_pending.is_empty() || spends_conflict {
            // Double spend among pending transactions: miners arbitrate,
            // the whole dependency closure is in conflict until they do.
            info!(%txid, "commit -> pending (in conflict)");
            Self::add_wallet_transaction(inner, keys, Pool::Pending, wtx)?;
            let mut closure: HashSet<Txid> = ds_pending;
            closure.insert(txid);
            Self::dependency_closure(inner, &mut closure);
            for id in &closure {
                self.confidence.set_in_conflict(*id);
                events.push(WalletEvent::ConfidenceChanged(*id));
            }
        } else {
            info!(%txid, "commit -> pending");
            self.confidence.set_pending(txid);
            events.push(WalletEvent::ConfidenceChanged(txid));
            Self::add_wallet_transaction(inner, keys, Pool::Pending, wtx)?;
        }

        Self::mark_keys_used(keys, &tx);

        let new_balance = (prev_balance.to_sat() as i128 + value_to_me.to_sat() as i128
            - value_from_me.to_sat() as i128)
            .max(0) as u64;
        let new_balance = bitcoin::Amount::from_sat(new_balance);
        if value_to_me > bitcoin::Amount::ZERO {
            events.push(WalletEvent::CoinsReceived { txid, prev_balance, new_balance });
        }
        if value_from_me > bitcoin::Amount::ZERO {
            events.push(WalletEvent::CoinsSent { txid, prev_balance, new_balance });
        }
        events.push(WalletEvent::Changed);

        self.check_balance_watchers(inner, keys);
        Self::is_consistent_or_throw(inner, keys)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Block delivery
    // ------------------------------------------------------------------

    /// Chain callback: a relevant transaction appeared in a block.
    ///
    /// Must be followed by [`Wallet::notify_new_best_block`] for the same
    /// block once all of its transactions have been delivered.
    pub fn receive_from_block(
        &self,
        tx: &Transaction,
        block: BlockId,
        kind: ChainEventType,
        offset: u32,
    ) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut keys = self.keys.lock();
            if !Self::is_relevant_locked(&inner, &keys, tx) {
                return Ok(());
            }
            self.receive_locked(&mut inner, &mut keys, &mut events, tx, block, kind, offset)?;
        }
        self.dispatch_events(&events);
        self.apply_save_action(SaveAction::Later);
        Ok(())
    }

    /// Chain callback for filtered blocks: a transaction we may already
    /// know appeared in a block. Returns whether the wallet recognized it.
    pub fn notify_tx_in_block(
        &self,
        txid: Txid,
        block: BlockId,
        kind: ChainEventType,
        offset: u32,
    ) -> Result<bool> {
        let mut events = Vec::new();
        let known = {
            let mut inner = self.inner.lock();
            let mut keys = self.keys.lock();
            let tx = match inner.store.get(&txid) {
                Some(wtx) => Some(wtx.tx.clone()),
                // A risk verdict means nothing once the network confirmed
                // the transaction anyway.
                None => inner.store.take_risk_dropped(&txid),
            };
            match tx {
                Some(tx) => {
                    self.receive_locked(
                        &mut inner, &mut keys, &mut events, &tx, block, kind, offset,
                    )?;
                    true
                }
                None => false,
            }
        };
        self.dispatch_events(&events);
        if known {
            self.apply_save_action(SaveAction::Later);
        }
        Ok(known)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn receive_locked(
        &self,
        inner: &mut WalletInner,
        keys: &mut KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        tx: &Transaction,
        block: BlockId,
        kind: ChainEventType,
        offset: u32,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        let best_chain = kind == ChainEventType::BestChain;
        let prev_balance = self.balance_locked(inner, keys, BalanceType::Estimated);
        let value_to_me = Self::value_to_me(keys, tx);
        let value_from_me = Self::value_from_me(inner, keys, tx);
        info!(%txid, height = block.height, offset, side_chain = !best_chain, "received from block");

        Self::mark_keys_used(keys, tx);

        let was_pending = inner.store.detach(&txid, Pool::Pending);
        if was_pending {
            debug!(%txid, "<-pending");
        }

        if best_chain {
            let was_dead = inner.store.detach(&txid, Pool::Dead);
            if was_dead {
                debug!(%txid, "<-dead");
            }
            if was_pending {
                // Disconnect any outputs already spent by our own pending
                // transactions; they reconnect during reprocessing below.
                for (vout, output) in tx.output.iter().enumerate() {
                    let outpoint = OutPoint { txid, vout: vout as u32 };
                    if inner.store.index.spender_of(&outpoint).is_some() {
                        let owned = keys.is_mine(&output.script_pubkey);
                        inner.store.index.disconnect(&outpoint, owned);
                    }
                }
            }
            self.process_tx_from_best_chain(
                inner,
                keys,
                events,
                txid,
                tx,
                was_pending || was_dead,
            )?;
        } else {
            // Side chains: record the appearance but treat the transaction
            // as pending, since miners may still confirm it on the best
            // chain.
            if was_pending {
                Self::attach_wallet_transaction(inner, keys, Pool::Pending, txid)?;
            } else if !inner.store.contains(&txid) {
                self.commit_locked(inner, keys, events, tx.clone(), TxPurpose::Unknown)?;
            }
        }

        if let Some(wtx) = inner.store.get_mut(&txid) {
            wtx.record_appearance(block.hash, offset);
            if wtx.update_time.is_none() {
                wtx.update_time = Some(block.time);
            }
        }

        if best_chain {
            self.confidence.mark_building(txid, block.height);
            // The depth was just set; the imminent best-block notification
            // for this same block must not double-count it.
            inner.ignore_next_block.insert(txid);

            // Transactions built on this one may have been in conflict;
            // with this confirmation their conflict may be resolved.
            let mut closure: HashSet<Txid> = HashSet::new();
            closure.insert(txid);
            Self::dependency_closure(inner, &mut closure);
            closure.remove(&txid);
            for dep in Self::sort_by_dependency(inner, closure) {
                if self.confidence.kind(&dep) != ConfidenceKind::InConflict {
                    continue;
                }
                let dep_tx = match inner.store.get(&dep) {
                    Some(wtx) => wtx.tx.clone(),
                    None => continue,
                };
                if !self.spends_confidence(inner, &dep_tx, ConfidenceKind::InConflict) {
                    self.confidence.set_pending(dep);
                    events.push(WalletEvent::ConfidenceChanged(dep));
                }
            }
            events.push(WalletEvent::ConfidenceChanged(txid));
        } else {
            events.push(WalletEvent::Changed);
        }

        if !inner.inside_reorg && best_chain {
            let new_balance = self.balance_locked(inner, keys, BalanceType::Estimated);
            if !was_pending {
                if value_to_me > value_from_me {
                    events.push(WalletEvent::CoinsReceived { txid, prev_balance, new_balance });
                } else if value_from_me > value_to_me {
                    events.push(WalletEvent::CoinsSent { txid, prev_balance, new_balance });
                }
            }
            self.check_balance_watchers(inner, keys);
        }

        Self::is_consistent_or_throw(inner, keys)?;
        inner.hard_save_on_next_block = true;
        Ok(())
    }

    /// Routes a newly best-chain transaction into the right pool and kills
    /// anything it double-spends.
    fn process_tx_from_best_chain(
        &self,
        inner: &mut WalletInner,
        keys: &mut KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        txid: Txid,
        tx: &Transaction,
        force_add: bool,
    ) -> Result<()> {
        if inner.store.in_pool(&txid, Pool::Pending) {
            return Err(Error::Consistency(format!(
                "transaction {txid} still pending while processing from best chain"
            )));
        }

        self.update_for_spends(inner, keys, txid, tx, true)?;

        let has_outputs_to_me = Self::value_to_me(keys, tx) > bitcoin::Amount::ZERO;
        let has_outputs_from_me =
            Self::value_from_me(inner, keys, tx) > bitcoin::Amount::ZERO;

        let pool = if has_outputs_to_me {
            if Self::is_every_owned_output_spent(inner, keys, &txid, tx) {
                debug!(%txid, "->spent (by pending)");
                Some(Pool::Spent)
            } else {
                debug!(%txid, "->unspent");
                Some(Pool::Unspent)
            }
        } else if has_outputs_from_me {
            debug!(%txid, "->spent");
            Some(Pool::Spent)
        } else if force_add {
            // Was pending or dead before; keep it for confidence tracking.
            debug!(%txid, "->spent (kept for records)");
            Some(Pool::Spent)
        } else {
            // Only relevant as a double-spend killer; not tracked itself.
            None
        };

        if let Some(pool) = pool {
            if inner.store.contains(&txid) {
                Self::attach_wallet_transaction(inner, keys, pool, txid)?;
            } else {
                let mut wtx = WalletTx::new(tx.clone());
                wtx.update_time = Some(now_unix());
                Self::add_wallet_transaction(inner, keys, pool, wtx)?;
            }
        }

        let double_spent = Self::find_double_spends(inner, &txid, tx, Some(Pool::Pending));
        if !double_spent.is_empty() {
            self.kill_txns(inner, keys, events, double_spent, Some((txid, tx)))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // New best block
    // ------------------------------------------------------------------

    /// Chain callback: a new block extends the best chain.
    ///
    /// Increments the depth of every building transaction (except those
    /// delivered by this very block) and records the last-seen triple.
    pub fn notify_new_best_block(&self, block: BlockId) -> Result<()> {
        let mut events = Vec::new();
        let save = {
            let mut inner = self.inner.lock();
            let keys = self.keys.lock();
            if inner.last_seen.map(|b| b.hash) == Some(block.hash) {
                return Ok(());
            }
            self.notify_new_best_block_locked(&mut inner, &keys, &mut events, block);
            if inner.hard_save_on_next_block {
                inner.hard_save_on_next_block = false;
                SaveAction::Now
            } else {
                SaveAction::Later
            }
        };
        self.dispatch_events(&events);
        self.apply_save_action(save);
        Ok(())
    }

    pub(crate) fn notify_new_best_block_locked(
        &self,
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        block: BlockId,
    ) {
        inner.last_seen = Some(block);
        for txid in inner.store.all_ids() {
            if inner.ignore_next_block.remove(&txid) {
                // Depth already accounted for by receive() for this block.
                continue;
            }
            if self.confidence.kind(&txid) == ConfidenceKind::Building {
                self.confidence.increment_depth(txid);
                events.push(WalletEvent::ConfidenceChanged(txid));
            }
        }
        events.push(WalletEvent::Changed);
        self.check_balance_watchers(inner, keys);
    }

    // ------------------------------------------------------------------
    // Connection machinery
    // ------------------------------------------------------------------

    fn connect_to_tracked(
        inner: &mut WalletInner,
        outpoint: OutPoint,
        spender: InputRef,
        mode: ConnectMode,
    ) -> ConnectionResult {
        if inner.store.output_of(&outpoint).is_none() {
            return ConnectionResult::NoSuchTx;
        }
        match inner.store.index.spender_of(&outpoint) {
            Some(existing) if existing == spender => ConnectionResult::Success,
            Some(_) => match mode {
                ConnectMode::AbortOnConflict => ConnectionResult::AlreadySpent,
                ConnectMode::DisconnectOnConflict => {
                    inner.store.index.record_spend(outpoint, spender);
                    ConnectionResult::Success
                }
            },
            None => {
                inner.store.index.record_spend(outpoint, spender);
                ConnectionResult::Success
            }
        }
    }

    fn connect_in_pool(
        inner: &mut WalletInner,
        outpoint: OutPoint,
        spender: InputRef,
        pool: Pool,
        mode: ConnectMode,
    ) -> ConnectionResult {
        if !inner.store.in_pool(&outpoint.txid, pool) {
            return ConnectionResult::NoSuchTx;
        }
        Self::connect_to_tracked(inner, outpoint, spender, mode)
    }

    /// Connects `tx`'s inputs to tracked outputs, and pending inputs to
    /// `tx`'s outputs, updating spent flags and pool membership.
    ///
    /// With `from_chain` set, a conflicting connection is the chain
    /// overriding us and is left for the kill path; otherwise two pending
    /// transactions double-spend each other and miner arbitration decides.
    pub(crate) fn update_for_spends(
        &self,
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        txid: Txid,
        tx: &Transaction,
        from_chain: bool,
    ) -> Result<()> {
        if from_chain && inner.store.in_pool(&txid, Pool::Pending) {
            return Err(Error::Consistency(format!(
                "chain transaction {txid} must not be in the pending pool"
            )));
        }
        for (i, input) in tx.input.iter().enumerate() {
            let spender = InputRef { spender: txid, index: i as u32 };
            let outpoint = input.previous_output;
            let mut result = ConnectionResult::NoSuchTx;
            for pool in [Pool::Unspent, Pool::Spent, Pool::Pending] {
                result =
                    Self::connect_in_pool(inner, outpoint, spender, pool, ConnectMode::AbortOnConflict);
                if result != ConnectionResult::NoSuchTx {
                    break;
                }
            }
            match result {
                ConnectionResult::NoSuchTx => {
                    // Doesn't spend any of our outputs, or is a coinbase.
                }
                ConnectionResult::AlreadySpent => {
                    if !from_chain {
                        warn!(%txid, input = i, "saw two pending transactions double spend each other");
                    }
                    // From chain: the winner is decided; killTxns will
                    // resolve the loser shortly.
                }
                ConnectionResult::Success => {
                    debug!(%outpoint, spent_by = %txid, "marked output as spent");
                    Self::maybe_move_pool(inner, keys, outpoint.txid)?;
                }
            }
        }

        // Pending transactions can cite outputs of a transaction we are
        // only now learning about (mempool ordering is not temporal).
        for pending_id in inner.store.ids_in(Pool::Pending) {
            if pending_id == txid {
                continue;
            }
            let citing: Vec<(u32, OutPoint)> = match inner.store.get(&pending_id) {
                Some(wtx) => wtx
                    .tx
                    .input
                    .iter()
                    .enumerate()
                    .filter(|(_, input)| input.previous_output.txid == txid)
                    .map(|(j, input)| (j as u32, input.previous_output))
                    .collect(),
                None => continue,
            };
            for (j, outpoint) in citing {
                if outpoint.vout as usize >= tx.output.len() {
                    continue;
                }
                let spender = InputRef { spender: pending_id, index: j };
                let result = match inner.store.index.spender_of(&outpoint) {
                    Some(existing) if existing == spender => ConnectionResult::Success,
                    Some(_) => ConnectionResult::AlreadySpent,
                    None => {
                        inner.store.index.record_spend(outpoint, spender);
                        ConnectionResult::Success
                    }
                };
                if from_chain && result == ConnectionResult::AlreadySpent {
                    return Err(Error::Consistency(format!(
                        "output {outpoint} of a fresh chain transaction is already spent"
                    )));
                }
                if result == ConnectionResult::Success {
                    debug!(pending = %pending_id, input = j, "connected pending input");
                }
            }
        }

        if !from_chain {
            Self::maybe_move_pool(inner, keys, txid)?;
        }
        Ok(())
    }

    /// Moves a confirmed transaction between UNSPENT and SPENT to match
    /// the state of its owned outputs.
    pub(crate) fn maybe_move_pool(
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        txid: Txid,
    ) -> Result<()> {
        let tx = match inner.store.get(&txid) {
            Some(wtx) => wtx.tx.clone(),
            None => return Ok(()),
        };
        if Self::is_every_owned_output_spent(inner, keys, &txid, &tx) {
            if inner.store.in_pool(&txid, Pool::Unspent) {
                debug!(%txid, "<-unspent ->spent");
                inner.store.move_to(txid, Pool::Unspent, Pool::Spent)?;
            }
        } else if inner.store.in_pool(&txid, Pool::Spent) {
            debug!(%txid, "<-spent ->unspent");
            inner.store.move_to(txid, Pool::Spent, Pool::Unspent)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Double-spend resolution
    // ------------------------------------------------------------------

    /// Transactions in `pool` (or anywhere) sharing an outpoint with `tx`.
    pub(crate) fn find_double_spends(
        inner: &WalletInner,
        txid: &Txid,
        tx: &Transaction,
        pool: Option<Pool>,
    ) -> HashSet<Txid> {
        let mut conflicts = HashSet::new();
        if tx.is_coinbase() {
            return conflicts;
        }
        let outpoints: HashSet<OutPoint> =
            tx.input.iter().map(|i| i.previous_output).collect();
        let candidates = match pool {
            Some(pool) => inner.store.ids_in(pool),
            None => inner.store.all_ids(),
        };
        for candidate in candidates {
            if candidate == *txid {
                continue;
            }
            let Some(wtx) = inner.store.get(&candidate) else { continue };
            // Outpoint equality is protocol-level: two inputs citing the
            // same outpoint conflict regardless of connection state.
            if wtx.tx.input.iter().any(|i| outpoints.contains(&i.previous_output)) {
                conflicts.insert(candidate);
            }
        }
        conflicts
    }

    /// Whether any input of `tx` spends a tracked transaction whose
    /// confidence is `kind`.
    pub(crate) fn spends_confidence(
        &self,
        inner: &WalletInner,
        tx: &Transaction,
        kind: ConfidenceKind,
    ) -> bool {
        tx.input.iter().any(|input| {
            let funding = input.previous_output.txid;
            inner.store.contains(&funding) && self.confidence.kind(&funding) == kind
        })
    }

    /// Grows `set` with every tracked transaction spending an output of a
    /// member, transitively.
    pub(crate) fn dependency_closure(inner: &WalletInner, set: &mut HashSet<Txid>) {
        let mut queue: Vec<Txid> = set.iter().copied().collect();
        let all = inner.store.all_ids();
        while let Some(txid) = queue.pop() {
            for other in &all {
                if set.contains(other) {
                    continue;
                }
                let Some(wtx) = inner.store.get(other) else { continue };
                if wtx.tx.input.iter().any(|i| i.previous_output.txid == txid) {
                    set.insert(*other);
                    queue.push(*other);
                }
            }
        }
    }

    /// Topological order: if B spends A, A comes before B.
    pub(crate) fn sort_by_dependency(inner: &WalletInner, set: HashSet<Txid>) -> Vec<Txid> {
        let mut remaining: Vec<Txid> = set.into_iter().collect();
        let mut sorted = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let mut progressed = false;
            let mut i = 0;
            while i < remaining.len() {
                let txid = remaining[i];
                let depends_on_remaining = inner.store.get(&txid).is_some_and(|wtx| {
                    wtx.tx
                        .input
                        .iter()
                        .any(|input| remaining.contains(&input.previous_output.txid))
                });
                if depends_on_remaining {
                    i += 1;
                } else {
                    sorted.push(txid);
                    remaining.swap_remove(i);
                    progressed = true;
                }
            }
            if !progressed {
                // A citation cycle cannot happen with valid transactions;
                // emit the rest in arbitrary order rather than spin.
                sorted.extend(remaining.drain(..));
            }
        }
        sorted
    }

    /// Kills `to_kill` and every tracked descendant, then connects the
    /// overriding transaction's inputs in their place.
    pub(crate) fn kill_txns(
        &self,
        inner: &mut WalletInner,
        keys: &KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        to_kill: HashSet<Txid>,
        overriding: Option<(Txid, &Transaction)>,
    ) -> Result<()> {
        let mut work: Vec<Txid> = to_kill.into_iter().collect();
        while let Some(dead_id) = work.pop() {
            if inner.store.in_pool(&dead_id, Pool::Dead) {
                continue;
            }
            let dead_tx = match inner.store.get(&dead_id) {
                Some(wtx) => wtx.tx.clone(),
                None => continue,
            };
            warn!(txid = %dead_id, overriding = ?overriding.map(|(id, _)| id), "transaction killed");

            for pool in [Pool::Pending, Pool::Unspent, Pool::Spent] {
                inner.store.detach(&dead_id, pool);
            }
            inner.store.attach(dead_id, Pool::Dead)?;

            // Release everything the dead transaction was spending.
            for (i, input) in dead_tx.input.iter().enumerate() {
                let outpoint = input.previous_output;
                let this_input = InputRef { spender: dead_id, index: i as u32 };
                if inner.store.index.spender_of(&outpoint) != Some(this_input) {
                    continue;
                }
                let funding_id = outpoint.txid;
                let owned = inner
                    .store
                    .output_of(&outpoint)
                    .map(|o| keys.is_mine(&o.script_pubkey))
                    .unwrap_or(false);
                let restore = owned && self.confidence.kind(&funding_id) != ConfidenceKind::Dead;
                inner.store.index.disconnect(&outpoint, restore);
                Self::maybe_move_pool(inner, keys, funding_id)?;
            }

            self.confidence.mark_dead(dead_id, overriding.map(|(id, _)| id));
            events.push(WalletEvent::ConfidenceChanged(dead_id));

            // Anything spending the dead transaction dies with it.
            for vout in 0..dead_tx.output.len() {
                let outpoint = OutPoint { txid: dead_id, vout: vout as u32 };
                inner.store.index.remove_unspent(&outpoint);
                if let Some(spender) = inner.store.index.spender_of(&outpoint) {
                    debug!(parent = %dead_id, child = %spender.spender, "death invalidated dependent tx");
                    work.push(spender.spender);
                }
            }
        }

        // Connect the winner's inputs in place of the losers'. Only a
        // tracked winner is connected: the spent index must never point
        // at a transaction outside the store.
        if let Some((overriding_id, overriding_tx)) =
            overriding.filter(|(id, _)| inner.store.contains(id))
        {
            for (i, input) in overriding_tx.input.iter().enumerate() {
                let spender = InputRef { spender: overriding_id, index: i as u32 };
                for pool in [Pool::Unspent, Pool::Spent] {
                    let result = Self::connect_in_pool(
                        inner,
                        input.previous_output,
                        spender,
                        pool,
                        ConnectMode::DisconnectOnConflict,
                    );
                    if result == ConnectionResult::Success {
                        Self::maybe_move_pool(inner, keys, input.previous_output.txid)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Removes risky pending transactions whose outputs are all unspent,
    /// releasing anything they were spending.
    pub fn cleanup(&self) -> Result<()> {
        let mut dirty = false;
        {
            let mut inner = self.inner.lock();
            let keys = self.keys.lock();
            for txid in inner.store.ids_in(Pool::Pending) {
                let tx = match inner.store.get(&txid) {
                    Some(wtx) => wtx.tx.clone(),
                    None => continue,
                };
                if !self.is_transaction_risky_locked(&inner, &tx) || self.accepts_risky() {
                    continue;
                }
                let any_output_spent = (0..tx.output.len()).any(|vout| {
                    let outpoint = OutPoint { txid, vout: vout as u32 };
                    inner.store.index.spender_of(&outpoint).is_some()
                });
                if any_output_spent {
                    info!(%txid, "cannot clean up risky tx, partially spent already");
                    continue;
                }
                for (i, input) in tx.input.iter().enumerate() {
                    let outpoint = input.previous_output;
                    let this_input = InputRef { spender: txid, index: i as u32 };
                    if inner.store.index.spender_of(&outpoint) == Some(this_input) {
                        let owned = inner
                            .store
                            .output_of(&outpoint)
                            .map(|o| keys.is_mine(&o.script_pubkey))
                            .unwrap_or(false);
                        inner.store.index.disconnect(&outpoint, owned);
                        Self::maybe_move_pool(&mut inner, &keys, outpoint.txid)?;
                    }
                }
                for vout in 0..tx.output.len() {
                    inner
                        .store
                        .index
                        .remove_unspent(&OutPoint { txid, vout: vout as u32 });
                }
                inner.store.remove(&txid);
                self.confidence.remove(&txid);
                info!(%txid, "removed risky transaction during cleanup");
                dirty = true;
            }
            if dirty {
                Self::is_consistent_or_throw(&inner, &keys)?;
            }
        }
        if dirty {
            self.apply_save_action(SaveAction::Later);
            self.dispatch_events(&[WalletEvent::Changed]);
        }
        Ok(())
    }

    fn is_transaction_risky_locked(&self, inner: &WalletInner, tx: &Transaction) -> bool {
        let context =
            RiskContext { height: inner.last_seen.map(|b| b.height), time: now_unix() };
        let analyzer = self.risk_analyzer.lock().clone();
        !analyzer.analyze(tx, &[], &context).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::Amount;

    use super::super::test_support::*;
    use crate::confidence::ConfidenceKind;
    use crate::risk::{RiskAnalyzer, RiskContext, RiskOutcome, RiskReason};
    use crate::types::{BalanceType, ChainEventType, Pool};

    #[test]
    fn test_receive_pending_then_confirm() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(100_000), 1);
        let txid = tx.compute_txid();

        wallet.receive_pending(&tx, &[]).expect("receive pending should succeed");

        assert_eq!(wallet.pool_of(&txid), Some(Pool::Pending));
        assert_eq!(wallet.balance(BalanceType::Available), Amount::ZERO);
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::from_sat(100_000));
        assert_eq!(wallet.confidence_table().kind(&txid), ConfidenceKind::Pending);

        confirm(&wallet, &tx, block(10, 0xA0));

        assert_eq!(wallet.pool_of(&txid), Some(Pool::Unspent));
        assert_eq!(wallet.balance(BalanceType::Available), Amount::from_sat(100_000));
        assert_eq!(wallet.confidence_table().depth(&txid), 1);
        assert!(wallet.is_consistent());
    }

    #[test]
    fn test_receive_pending_is_idempotent() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(40_000), 2);

        wallet.receive_pending(&tx, &[]).expect("first delivery should succeed");
        wallet.receive_pending(&tx, &[]).expect("second delivery should succeed");

        assert_eq!(wallet.pool_size(Pool::Pending), 1);
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::from_sat(40_000));
        assert_eq!(wallet.my_unspents().len(), 1);
    }

    #[test]
    fn test_irrelevant_pending_is_discarded() {
        let wallet = test_wallet();
        let other = test_wallet();
        let tx = funding_tx(&other, Amount::from_sat(40_000), 3);

        wallet.receive_pending(&tx, &[]).expect("delivery should succeed");

        assert_eq!(wallet.pool_size(Pool::Pending), 0);
        assert!(!wallet.is_pending_relevant(&tx));
    }

    #[test]
    fn test_commit_spend_marks_outputs_spent() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 4);
        let funding_id = funding.compute_txid();
        confirm(&wallet, &funding, block(10, 0xA1));

        let outpoint = bitcoin::OutPoint { txid: funding_id, vout: 0 };
        let change = wallet.current_change_script().expect("change script");
        let spend = spend_tx(outpoint, Amount::from_sat(99_000), change);
        let spend_id = spend.compute_txid();

        wallet.commit(spend).expect("commit should succeed");

        // All owned outputs of the funding tx are now spent.
        assert_eq!(wallet.pool_of(&funding_id), Some(Pool::Spent));
        assert_eq!(wallet.pool_of(&spend_id), Some(Pool::Pending));
        assert_eq!(wallet.my_unspents(), vec![bitcoin::OutPoint { txid: spend_id, vout: 0 }]);
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::from_sat(99_000));
        assert!(wallet.is_consistent());
    }

    #[test]
    fn test_commit_twice_fails_but_maybe_commit_does_not() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(10_000), 5);

        wallet.commit(tx.clone()).expect("first commit should succeed");
        let err = wallet.commit(tx.clone()).expect_err("second commit should fail");
        assert!(matches!(err, crate::errors::Error::AlreadyPending(_)));
        assert!(!wallet.maybe_commit(tx).expect("maybe_commit should not fail"));
    }

    #[test]
    fn test_mutual_pending_double_spend_goes_in_conflict() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 6);
        let funding_id = funding.compute_txid();
        confirm(&wallet, &funding, block(10, 0xA2));

        let outpoint = bitcoin::OutPoint { txid: funding_id, vout: 0 };
        let first = spend_tx(
            outpoint,
            Amount::from_sat(90_000),
            wallet.current_change_script().expect("change script"),
        );
        let second = spend_tx(outpoint, Amount::from_sat(80_000), foreign_script());
        let first_id = first.compute_txid();
        let second_id = second.compute_txid();

        wallet.commit(first).expect("first commit should succeed");
        wallet.commit(second).expect("second commit should succeed");

        // Neither wins until a miner decides.
        assert_eq!(wallet.confidence_table().kind(&first_id), ConfidenceKind::InConflict);
        assert_eq!(wallet.confidence_table().kind(&second_id), ConfidenceKind::InConflict);
        assert_eq!(wallet.pool_of(&first_id), Some(Pool::Pending));
        assert_eq!(wallet.pool_of(&second_id), Some(Pool::Pending));
    }

    #[test]
    fn test_chain_double_spend_kills_pending_and_descendants() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 7);
        let funding_id = funding.compute_txid();
        confirm(&wallet, &funding, block(10, 0xA3));

        let outpoint = bitcoin::OutPoint { txid: funding_id, vout: 0 };
        let pending = spend_tx(
            outpoint,
            Amount::from_sat(90_000),
            wallet.current_change_script().expect("change script"),
        );
        let pending_id = pending.compute_txid();
        wallet.commit(pending).expect("commit should succeed");

        // A child spending the pending change dies with its parent.
        let child = spend_tx(
            bitcoin::OutPoint { txid: pending_id, vout: 0 },
            Amount::from_sat(85_000),
            wallet.current_change_script().expect("change script"),
        );
        let child_id = child.compute_txid();
        wallet.commit(child).expect("child commit should succeed");

        let overrider = spend_tx(outpoint, Amount::from_sat(95_000), foreign_script());
        let overrider_id = overrider.compute_txid();
        wallet
            .receive_from_block(&overrider, block(11, 0xA4), ChainEventType::BestChain, 0)
            .expect("receive should succeed");
        wallet.notify_new_best_block(block(11, 0xA4)).expect("notify should succeed");

        assert_eq!(wallet.pool_of(&pending_id), Some(Pool::Dead));
        assert_eq!(wallet.pool_of(&child_id), Some(Pool::Dead));
        let record = wallet.confidence_table().get(&pending_id);
        assert_eq!(record.kind, ConfidenceKind::Dead);
        assert_eq!(record.overriding_txid, Some(overrider_id));
        assert_eq!(wallet.pool_of(&overrider_id), Some(Pool::Spent));
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::ZERO);
        assert!(wallet.is_consistent());
    }

    #[test]
    fn test_spending_dead_output_is_dead_on_arrival() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 8);
        let funding_id = funding.compute_txid();
        confirm(&wallet, &funding, block(10, 0xA5));
        let outpoint = bitcoin::OutPoint { txid: funding_id, vout: 0 };

        let loser = spend_tx(
            outpoint,
            Amount::from_sat(90_000),
            wallet.current_change_script().expect("change script"),
        );
        let loser_id = loser.compute_txid();
        wallet.commit(loser).expect("commit should succeed");
        let winner = spend_tx(outpoint, Amount::from_sat(95_000), foreign_script());
        wallet
            .receive_from_block(&winner, block(11, 0xA6), ChainEventType::BestChain, 0)
            .expect("receive should succeed");

        // A late child of the dead transaction goes straight to DEAD.
        let late_child = spend_tx(
            bitcoin::OutPoint { txid: loser_id, vout: 0 },
            Amount::from_sat(80_000),
            wallet.current_change_script().expect("change script"),
        );
        let late_id = late_child.compute_txid();
        wallet.commit(late_child).expect("commit should succeed");

        assert_eq!(wallet.pool_of(&late_id), Some(Pool::Dead));
    }

    #[test]
    fn test_side_chain_appearance_stays_pending() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 9);
        let txid = tx.compute_txid();
        wallet.receive_pending(&tx, &[]).expect("pending should succeed");

        wallet
            .receive_from_block(&tx, block(10, 0xA7), ChainEventType::SideChain, 0)
            .expect("side chain receive should succeed");

        assert_eq!(wallet.pool_of(&txid), Some(Pool::Pending));
        assert_eq!(wallet.confidence_table().kind(&txid), ConfidenceKind::Pending);
        assert_eq!(wallet.balance(BalanceType::Available), Amount::ZERO);
    }

    #[test]
    fn test_notify_new_best_block_increments_depth_once() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 10);
        let txid = tx.compute_txid();
        confirm(&wallet, &tx, block(10, 0xA8));
        assert_eq!(wallet.confidence_table().depth(&txid), 1);

        // Announcing the same block again changes nothing.
        wallet.notify_new_best_block(block(10, 0xA8)).expect("notify should succeed");
        assert_eq!(wallet.confidence_table().depth(&txid), 1);

        wallet.notify_new_best_block(block(11, 0xA9)).expect("notify should succeed");
        assert_eq!(wallet.confidence_table().depth(&txid), 2);
        assert_eq!(wallet.last_seen_block().map(|b| b.height), Some(11));
    }

    struct AlwaysRisky;

    impl RiskAnalyzer for AlwaysRisky {
        fn analyze(
            &self,
            _tx: &bitcoin::Transaction,
            _deps: &[bitcoin::Transaction],
            _context: &RiskContext,
        ) -> RiskOutcome {
            RiskOutcome::Risky(RiskReason::NonFinal)
        }
    }

    #[test]
    fn test_risky_pending_diverts_to_ring() {
        let wallet = test_wallet();
        wallet.set_risk_analyzer(Arc::new(AlwaysRisky));
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 11);

        wallet.receive_pending(&tx, &[]).expect("delivery should succeed");

        assert_eq!(wallet.pool_size(Pool::Pending), 0);
        assert_eq!(wallet.risk_dropped_count(), 1);
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::ZERO);
    }

    #[test]
    fn test_accept_risky_commits_anyway() {
        let wallet = test_wallet();
        wallet.set_risk_analyzer(Arc::new(AlwaysRisky));
        wallet.set_accept_risky(true);
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 12);

        wallet.receive_pending(&tx, &[]).expect("delivery should succeed");

        assert_eq!(wallet.pool_size(Pool::Pending), 1);
        assert_eq!(wallet.risk_dropped_count(), 0);
    }

    #[test]
    fn test_notify_tx_in_block_adopts_risk_dropped() {
        let wallet = test_wallet();
        wallet.set_risk_analyzer(Arc::new(AlwaysRisky));
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 13);
        let txid = tx.compute_txid();
        wallet.receive_pending(&tx, &[]).expect("delivery should succeed");
        assert_eq!(wallet.risk_dropped_count(), 1);

        let known = wallet
            .notify_tx_in_block(txid, block(10, 0xAA), ChainEventType::BestChain, 0)
            .expect("notify should succeed");

        assert!(known);
        assert_eq!(wallet.risk_dropped_count(), 0);
        assert_eq!(wallet.pool_of(&txid), Some(Pool::Unspent));
    }

    #[test]
    fn test_notify_tx_in_block_unknown_tx() {
        let wallet = test_wallet();
        let known = wallet
            .notify_tx_in_block(
                bitcoin::Txid::from_raw_hash(bitcoin::hashes::Hash::all_zeros()),
                block(10, 0xAB),
                ChainEventType::BestChain,
                0,
            )
            .expect("notify should succeed");
        assert!(!known);
    }

    #[test]
    fn test_cleanup_removes_risky_unspent_pending() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(50_000), 14);
        let txid = tx.compute_txid();
        wallet.receive_pending(&tx, &[]).expect("delivery should succeed");
        assert_eq!(wallet.pool_size(Pool::Pending), 1);

        // The policy tightened after the transaction was accepted.
        wallet.set_risk_analyzer(Arc::new(AlwaysRisky));
        wallet.cleanup().expect("cleanup should succeed");

        assert_eq!(wallet.pool_size(Pool::Pending), 0);
        assert!(wallet.pools_of(&txid).is_empty());
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::ZERO);
        assert!(wallet.is_consistent());
    }
}
