//! Chain reorganization replay
//!
//! When the best chain's tip moves to a different branch, every
//! transaction in the rolled-back blocks is disconnected (in reverse
//! in-block order), demoted to PENDING, and then the new branch is
//! replayed through the ordinary block-delivery path. Coinbase
//! transactions from the old branch are killed outright, along with their
//! tracked descendants. Dead transactions stay dead: the network's
//! mempools have already forgotten the losers.

use std::collections::HashMap;

use bitcoin::{BlockHash, OutPoint, Txid};
use tracing::{info, warn};

use super::{SaveAction, Wallet, WalletInner};
use crate::confidence::ConfidenceKind;
use crate::errors::{Error, Result};
use crate::events::WalletEvent;
use crate::keys::KeyChainGroup;
use crate::types::{BlockId, ChainEventType, Pool};

impl Wallet {
    /// Chain callback: the best chain rolled back to `split_point`,
    /// dropping `old_blocks` and adopting `new_blocks` (both ordered tip
    /// first).
    ///
    /// Any consistency violation surfaced during replay is fatal: the
    /// wallet is left in a best-effort state and the error propagated.
    pub fn reorganize(
        &self,
        split_point: BlockId,
        old_blocks: &[BlockId],
        new_blocks: &[BlockId],
    ) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let mut keys = self.keys.lock();
            if inner.inside_reorg {
                return Err(Error::Consistency("nested reorganize call".into()));
            }
            inner.inside_reorg = true;
            let result = self.reorganize_locked(
                &mut inner,
                &mut keys,
                &mut events,
                split_point,
                old_blocks,
                new_blocks,
            );
            inner.inside_reorg = false;
            result
        };
        self.dispatch_events(&events);
        self.apply_save_action(SaveAction::Later);
        result
    }

    fn reorganize_locked(
        &self,
        inner: &mut WalletInner,
        keys: &mut KeyChainGroup,
        events: &mut Vec<WalletEvent>,
        split_point: BlockId,
        old_blocks: &[BlockId],
        new_blocks: &[BlockId],
    ) -> Result<()> {
        info!(
            split = %split_point.hash,
            old = old_blocks.len(),
            new = new_blocks.len(),
            "reorganize"
        );

        // Bucket every tracked transaction by the blocks it appears in,
        // ordered by in-block offset.
        let mut by_block: HashMap<BlockHash, Vec<(u32, Txid)>> = HashMap::new();
        for txid in inner.store.all_ids() {
            if let Some(wtx) = inner.store.get(&txid) {
                for (block_hash, offset) in &wtx.appearances {
                    by_block.entry(*block_hash).or_default().push((*offset, txid));
                }
            }
        }
        for list in by_block.values_mut() {
            list.sort_unstable();
        }

        // Disconnect the old branch, tip toward split, each block in
        // reverse in-block order.
        let mut buffered: Vec<Txid> = Vec::new();
        for block in old_blocks {
            let Some(list) = by_block.get(&block.hash) else { continue };
            for (_, txid) in list.iter().rev() {
                let Some(wtx) = inner.store.get(txid) else { continue };
                if wtx.is_coinbase() {
                    // The maturity rule should make this unreachable, but a
                    // shallow reorg of an immature coinbase kills it and
                    // everything rooted in it.
                    warn!(%txid, "coinbase killed by reorg");
                    self.kill_txns(inner, keys, events, [*txid].into(), None)?;
                    continue;
                }
                if inner.store.in_pool(txid, Pool::Dead) {
                    // Killed moments ago as a descendant; dead stays dead.
                    continue;
                }
                if inner.store.in_pool(txid, Pool::Pending) {
                    return Err(Error::Consistency(format!(
                        "transaction {txid} from an old block is pending before disconnect"
                    )));
                }
                let output_count = wtx.tx.output.len();
                let scripts: Vec<_> =
                    wtx.tx.output.iter().map(|o| o.script_pubkey.clone()).collect();
                for vout in 0..output_count {
                    let outpoint = OutPoint { txid: *txid, vout: vout as u32 };
                    if inner.store.index.spender_of(&outpoint).is_some() {
                        let owned = keys.is_mine(&scripts[vout]);
                        inner.store.index.disconnect(&outpoint, owned);
                    }
                }
                inner.store.detach(txid, Pool::Unspent);
                inner.store.detach(txid, Pool::Spent);
                buffered.push(*txid);
            }
        }

        // Old-branch transactions go back to pending and reconnect among
        // themselves and the existing pending set.
        for txid in &buffered {
            info!(%txid, "->pending (reorg)");
            self.confidence.set_pending(*txid);
            events.push(WalletEvent::ConfidenceChanged(*txid));
            Self::attach_wallet_transaction(inner, keys, Pool::Pending, *txid)?;
            let tx = match inner.store.get(txid) {
                Some(wtx) => wtx.tx.clone(),
                None => continue,
            };
            self.update_for_spends(inner, keys, *txid, &tx, false)?;
        }

        // The rolled-back blocks no longer contribute depth to anything
        // that stayed confirmed.
        let depth_to_subtract = old_blocks.len() as u32;
        if depth_to_subtract > 0 {
            for pool in [Pool::Unspent, Pool::Spent, Pool::Dead] {
                for txid in inner.store.ids_in(pool) {
                    if self.confidence.kind(&txid) == ConfidenceKind::Building {
                        self.confidence.subtract_depth(txid, depth_to_subtract);
                        events.push(WalletEvent::ConfidenceChanged(txid));
                    }
                }
            }
        }

        inner.last_seen = Some(split_point);

        // Replay the new branch bottom-up through the ordinary receive
        // path; this pulls transactions back out of pending and kills
        // conflicting ones.
        for block in new_blocks.iter().rev() {
            info!(block = %block.hash, "replaying block");
            if let Some(list) = by_block.get(&block.hash).cloned() {
                for (offset, txid) in list {
                    let tx = match inner.store.get(&txid) {
                        Some(wtx) => wtx.tx.clone(),
                        None => continue,
                    };
                    self.receive_locked(
                        inner,
                        keys,
                        events,
                        &tx,
                        *block,
                        ChainEventType::BestChain,
                        offset,
                    )?;
                }
            }
            self.notify_new_best_block_locked(inner, keys, events, *block);
        }

        Self::is_consistent_or_throw(inner, keys)?;
        events.push(WalletEvent::Reorganized);
        events.push(WalletEvent::Changed);
        self.check_balance_watchers(inner, keys);
        Ok(())
    }
}
