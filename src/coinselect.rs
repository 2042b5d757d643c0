//! Coin selection
//!
//! Selectors choose which spendable outputs fund a payment. The default
//! policy spends confirmed coins plus this wallet's own propagated change;
//! the key-time selector gathers everything controlled by pre-rotation
//! keys; the filtering selector excludes outpoints already earmarked
//! elsewhere. Selectors are pluggable per wallet and per send request.

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, ScriptBuf};

use crate::confidence::Source;
use crate::types::{COINBASE_MATURITY, ROTATION_MAX_INPUTS};

/// A spendable output offered to a selector.
#[derive(Clone, Debug)]
pub struct SpendCandidate {
    /// The output's location.
    pub outpoint: OutPoint,
    /// Its value.
    pub value: Amount,
    /// Its locking script.
    pub script_pubkey: ScriptBuf,
    /// Confirmation depth of the parent transaction; 0 if unconfirmed.
    pub depth: u32,
    /// Where the parent transaction came from.
    pub source: Source,
    /// How many peers have announced the parent transaction.
    pub broadcast_peers: usize,
    /// Whether the parent is a coinbase transaction.
    pub coinbase: bool,
    /// Creation time of the controlling key, for rotation decisions.
    pub key_creation_time: Option<u64>,
}

/// The outputs a selector settled on.
#[derive(Clone, Debug, Default)]
pub struct CoinSelection {
    /// The selected outputs, in selection order.
    pub selected: Vec<SpendCandidate>,
}

impl CoinSelection {
    /// Total value of the selection.
    pub fn total(&self) -> Amount {
        self.selected.iter().map(|c| c.value).sum()
    }
}

/// Chooses outputs to cover a target value.
pub trait CoinSelector: Send + Sync {
    /// Selects from `candidates` until `target` is covered, or returns
    /// what it could gather.
    fn select(&self, target: Amount, candidates: Vec<SpendCandidate>) -> CoinSelection;
}

/// The default policy.
///
/// Eligible outputs are mature, and either confirmed or change from a
/// transaction this wallet created that at least one peer has accepted.
/// Larger values are preferred; among equal values, shallower coins go
/// first so old coins stay put for key rotation to sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCoinSelector;

impl DefaultCoinSelector {
    /// Whether the default policy would consider spending `candidate`.
    pub fn is_selectable(candidate: &SpendCandidate) -> bool {
        if candidate.coinbase && candidate.depth < COINBASE_MATURITY {
            return false;
        }
        if candidate.depth >= 1 {
            return true;
        }
        candidate.source == Source::Own && candidate.broadcast_peers >= 1
    }
}

impl CoinSelector for DefaultCoinSelector {
    fn select(&self, target: Amount, candidates: Vec<SpendCandidate>) -> CoinSelection {
        let mut eligible: Vec<SpendCandidate> =
            candidates.into_iter().filter(Self::is_selectable).collect();
        eligible.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then(a.depth.cmp(&b.depth))
                .then(a.outpoint.txid.cmp(&b.outpoint.txid))
                .then(a.outpoint.vout.cmp(&b.outpoint.vout))
        });
        let mut selection = CoinSelection::default();
        let mut gathered = Amount::ZERO;
        for candidate in eligible {
            if gathered >= target {
                break;
            }
            gathered += candidate.value;
            selection.selected.push(candidate);
        }
        selection
    }
}

/// Selects every mature output controlled by a key created before the
/// rotation threshold, bounded so one batch stays well under the standard
/// transaction size. The target value is ignored.
#[derive(Clone, Copy, Debug)]
pub struct KeyTimeCoinSelector {
    /// Keys created strictly before this time are rotating.
    pub rotation_time: u64,
    /// Skip unconfirmed outputs; rotating those races the attacker and
    /// tends to create stuck double spends.
    pub ignore_pending: bool,
}

impl CoinSelector for KeyTimeCoinSelector {
    fn select(&self, _target: Amount, candidates: Vec<SpendCandidate>) -> CoinSelection {
        let mut selection = CoinSelection::default();
        for candidate in candidates {
            if selection.selected.len() >= ROTATION_MAX_INPUTS {
                tracing::warn!("key-time selection hit the input bound, more batches needed");
                break;
            }
            if self.ignore_pending && candidate.depth == 0 {
                continue;
            }
            if candidate.coinbase && candidate.depth < COINBASE_MATURITY {
                continue;
            }
            match candidate.key_creation_time {
                Some(created) if created < self.rotation_time =>
                    selection.selected.push(candidate),
                _ => {}
            }
        }
        selection
    }
}

/// Excludes a set of outpoints before delegating to another selector.
pub struct FilteringCoinSelector<S> {
    inner: S,
    excluded: HashSet<OutPoint>,
}

impl<S: CoinSelector> FilteringCoinSelector<S> {
    /// Wraps `inner`, hiding `excluded` outpoints from it.
    pub fn new(inner: S, excluded: HashSet<OutPoint>) -> Self { Self { inner, excluded } }
}

impl<S: CoinSelector> CoinSelector for FilteringCoinSelector<S> {
    fn select(&self, target: Amount, candidates: Vec<SpendCandidate>) -> CoinSelection {
        let remaining =
            candidates.into_iter().filter(|c| !self.excluded.contains(&c.outpoint)).collect();
        self.inner.select(target, remaining)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    use super::*;

    fn candidate(byte: u8, value: u64, depth: u32) -> SpendCandidate {
        SpendCandidate {
            outpoint: OutPoint { txid: Txid::from_byte_array([byte; 32]), vout: 0 },
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new(),
            depth,
            source: Source::Network,
            broadcast_peers: 0,
            coinbase: false,
            key_creation_time: Some(1_000),
        }
    }

    #[test]
    fn test_default_selects_largest_first() {
        let selector = DefaultCoinSelector;
        let candidates =
            vec![candidate(1, 10_000, 3), candidate(2, 50_000, 3), candidate(3, 20_000, 3)];

        let selection = selector.select(Amount::from_sat(60_000), candidates);

        assert_eq!(selection.selected.len(), 2);
        assert_eq!(selection.selected[0].value, Amount::from_sat(50_000));
        assert_eq!(selection.total(), Amount::from_sat(70_000));
    }

    #[test]
    fn test_default_prefers_newer_on_value_tie() {
        let selector = DefaultCoinSelector;
        let candidates = vec![candidate(1, 10_000, 50), candidate(2, 10_000, 2)];

        let selection = selector.select(Amount::from_sat(5_000), candidates);

        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].depth, 2);
    }

    #[test]
    fn test_default_skips_unconfirmed_foreign() {
        let selector = DefaultCoinSelector;
        let mut pending = candidate(1, 10_000, 0);
        pending.source = Source::Network;
        pending.broadcast_peers = 5;

        let selection = selector.select(Amount::from_sat(5_000), vec![pending]);

        assert!(selection.selected.is_empty());
    }

    #[test]
    fn test_default_accepts_own_propagated_change() {
        let selector = DefaultCoinSelector;
        let mut change = candidate(1, 10_000, 0);
        change.source = Source::Own;
        change.broadcast_peers = 1;

        let selection = selector.select(Amount::from_sat(5_000), vec![change]);

        assert_eq!(selection.selected.len(), 1);
    }

    #[test]
    fn test_default_enforces_coinbase_maturity() {
        let selector = DefaultCoinSelector;
        let mut young = candidate(1, 10_000, 50);
        young.coinbase = true;
        let mut mature = candidate(2, 10_000, COINBASE_MATURITY);
        mature.coinbase = true;

        let selection = selector.select(Amount::from_sat(50_000), vec![young, mature]);

        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].outpoint.txid, Txid::from_byte_array([2; 32]));
    }

    #[test]
    fn test_key_time_selects_only_rotating() {
        let selector = KeyTimeCoinSelector { rotation_time: 1_500, ignore_pending: true };
        let mut fresh = candidate(1, 10_000, 3);
        fresh.key_creation_time = Some(2_000);
        let old = candidate(2, 20_000, 3);
        let mut pending_old = candidate(3, 30_000, 0);
        pending_old.key_creation_time = Some(100);

        let selection =
            selector.select(Amount::ZERO, vec![fresh, old, pending_old]);

        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].value, Amount::from_sat(20_000));
    }

    #[test]
    fn test_filtering_excludes_outpoints() {
        let excluded: HashSet<OutPoint> =
            [OutPoint { txid: Txid::from_byte_array([1; 32]), vout: 0 }].into();
        let selector = FilteringCoinSelector::new(DefaultCoinSelector, excluded);
        let candidates = vec![candidate(1, 50_000, 3), candidate(2, 20_000, 3)];

        let selection = selector.select(Amount::from_sat(10_000), candidates);

        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].value, Amount::from_sat(20_000));
    }
}
