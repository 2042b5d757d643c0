//! Key-rotation maintenance
//!
//! When a rotation time is set, any key created before it is presumed
//! compromised and the value it controls is migrated to fresh keys in
//! size-bounded batches. Maintenance is driven by the application (it may
//! need the user's password for an encrypted wallet) and repeats until no
//! rotating coins remain.

use std::collections::HashSet;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tracing::{error, info};

use super::send::SendRequest;
use super::{now_unix, Wallet};
use crate::coinselect::{CoinSelector, FilteringCoinSelector, KeyTimeCoinSelector};
use crate::confidence::Source;
use crate::errors::{Error, KeyError, Result};
use crate::types::{TxPurpose, MAX_STANDARD_TX_SIZE, REFERENCE_MIN_FEE_PER_KB, ROTATION_MAX_INPUTS};

impl Wallet {
    /// Sets (or clears) the key-rotation threshold: keys created before
    /// `time` are considered compromised and their funds migrated by
    /// [`Wallet::do_maintenance`]. The time cannot be in the future.
    pub fn set_key_rotation_time(&self, time: Option<u64>) -> Result<()> {
        if let Some(t) = time {
            if t > now_unix() {
                return Err(Error::Consistency(
                    "key rotation time cannot be in the future".into(),
                ));
            }
        }
        *self.key_rotation_time.lock() = time;
        Ok(())
    }

    /// The configured rotation threshold, if any.
    pub fn key_rotation_time(&self) -> Option<u64> { *self.key_rotation_time.lock() }

    /// Whether a key created at `creation_time` is rotating.
    pub fn is_key_rotating(&self, creation_time: u64) -> bool {
        self.key_rotation_time().map(|t| creation_time < t).unwrap_or(false)
    }

    /// Crafts (and optionally signs, commits and broadcasts) the
    /// transactions needed to move value off rotating keys.
    ///
    /// Call periodically; new coins can keep arriving on rotating
    /// addresses. Returns the maintenance transactions made this round,
    /// possibly empty.
    ///
    /// # Errors
    /// [`KeyError::KeyRotationRequiresPassword`] when signing is requested
    /// on an encrypted wallet without the user key;
    /// [`KeyError::DeterministicUpgradeRequiresPassword`] when a fresh
    /// chain must be synthesized and the user key is missing.
    pub fn do_maintenance(
        &self,
        user_key: Option<&[u8]>,
        sign_and_send: bool,
    ) -> Result<Vec<Transaction>> {
        let rotation_time = match self.key_rotation_time() {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };

        {
            let mut keys = self.keys.lock();
            if keys.all_chains_rotating(rotation_time) {
                let script_type = keys.active_chain().script_type();
                info!(
                    ?script_type,
                    "all deterministic chains are rotating, creating a fresh chain; \
                     backup required after this"
                );
                keys.synthesize_fresh_chain(script_type, user_key, now_unix())?;
            }
            if sign_and_send && keys.is_encrypted() && user_key.is_none() {
                return Err(KeyError::KeyRotationRequiresPassword.into());
            }
        }

        // Transactions are size limited, so the wallet may need several
        // batches; a batch using the full input bound means more remain.
        let mut results: Vec<Transaction> = Vec::new();
        loop {
            match self.rekey_one_batch(rotation_time, user_key, &results, sign_and_send)? {
                Some(tx) => {
                    let full_batch = tx.input.len() >= ROTATION_MAX_INPUTS;
                    results.push(tx);
                    if !full_batch {
                        break;
                    }
                }
                None => break,
            }
        }

        for tx in &results {
            self.maybe_commit_with_purpose(tx.clone(), TxPurpose::KeyRotation)?;
        }
        if sign_and_send {
            if let Some(broadcaster) = self.broadcaster() {
                for tx in &results {
                    let handle = broadcaster.broadcast(tx);
                    info!(txid = %handle.txid(), "broadcasting key rotation tx");
                }
            }
        }
        Ok(results)
    }

    fn rekey_one_batch(
        &self,
        rotation_time: u64,
        user_key: Option<&[u8]>,
        others: &[Transaction],
        sign: bool,
    ) -> Result<Option<Transaction>> {
        let (tx, connected) = {
            let inner = self.inner.lock();
            let mut keys = self.keys.lock();

            // Outputs already claimed by earlier batches must not be
            // reselected; unconfirmed outputs are skipped because rotating
            // them races the attacker and creates stuck double spends.
            let excluded: HashSet<OutPoint> = others
                .iter()
                .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
                .collect();
            let selector = FilteringCoinSelector::new(
                KeyTimeCoinSelector { rotation_time, ignore_pending: true },
                excluded,
            );
            let candidates = self.spend_candidates_locked(&inner, &keys, true);
            let selection = selector.select(Amount::ZERO, candidates);
            if selection.selected.is_empty() {
                return Ok(None);
            }

            // When not signing, don't waste addresses.
            let destination: ScriptBuf = if sign {
                keys.fresh_receive_script()?
            } else {
                keys.current_receive_script()?
            };

            let mut tx = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: selection
                    .selected
                    .iter()
                    .map(|c| TxIn {
                        previous_output: c.outpoint,
                        script_sig: ScriptBuf::new(),
                        sequence: Sequence::MAX,
                        witness: Witness::new(),
                    })
                    .collect(),
                output: vec![TxOut { value: selection.total(), script_pubkey: destination }],
            };

            if !self.adjust_output_downwards(
                &keys,
                &mut tx,
                &selection,
                REFERENCE_MIN_FEE_PER_KB,
                true,
            )? {
                error!("failed to adjust key rotation tx for fees");
                return Ok(None);
            }

            let connected = Self::connected_outputs(&inner, &tx);
            (tx, connected)
        };

        let mut req = SendRequest::for_tx(tx);
        req.user_key = user_key.map(|k| k.to_vec());
        if sign {
            self.sign_request_with(&mut req, &connected)?;
        }
        let tx = req.tx;

        // The key-time selector's input bound keeps batches well inside
        // the standard size; exceeding it means the estimate broke down.
        if tx.total_size() > MAX_STANDARD_TX_SIZE {
            return Err(Error::Consistency("key rotation batch exceeds standard size".into()));
        }
        self.confidence.set_source(tx.compute_txid(), Source::Own);
        Ok(Some(tx))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Amount;

    use super::super::test_support::*;
    use crate::errors::{Error, KeyError};
    use crate::keys::{KeyBag, KeyCrypter};
    use crate::types::{BalanceType, Pool};

    struct StubCrypter;

    impl KeyCrypter for StubCrypter {
        fn encrypt(&self, plaintext: &[u8], user_key: &[u8]) -> Vec<u8> {
            let mut out = user_key.to_vec();
            out.extend(plaintext.iter().zip(user_key.iter().cycle()).map(|(p, k)| p ^ k));
            out
        }

        fn decrypt(&self, ciphertext: &[u8], user_key: &[u8]) -> crate::errors::Result<Vec<u8>> {
            if ciphertext.len() < user_key.len() || &ciphertext[..user_key.len()] != user_key {
                return Err(KeyError::BadEncryptionKey.into());
            }
            Ok(ciphertext[user_key.len()..]
                .iter()
                .zip(user_key.iter().cycle())
                .map(|(c, k)| c ^ k)
                .collect())
        }
    }

    #[test]
    fn test_no_rotation_time_is_a_no_op() {
        let wallet = test_wallet();
        let made = wallet.do_maintenance(None, false).expect("maintenance should succeed");
        assert!(made.is_empty());
    }

    #[test]
    fn test_rotation_time_cannot_be_future() {
        let wallet = test_wallet();
        let err = wallet
            .set_key_rotation_time(Some(u64::MAX))
            .expect_err("future rotation time should fail");
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_rotation_moves_funds_to_fresh_chain() {
        let wallet = test_wallet_created_at(1_000);
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 1);
        confirm(&wallet, &funding, block(10, 0xC0));

        let chain_created =
            wallet.with_keys(|keys| keys.active_chain().creation_time());
        wallet
            .set_key_rotation_time(Some(chain_created + 1))
            .expect("setting rotation time should succeed");
        assert!(wallet.is_key_rotating(chain_created));

        let made = wallet.do_maintenance(None, true).expect("maintenance should succeed");

        assert_eq!(made.len(), 1);
        let rotation = &made[0];
        assert_eq!(rotation.input.len(), 1);
        assert_eq!(rotation.output.len(), 1);
        let moved = rotation.output[0].value;
        assert!(moved < Amount::from_sat(100_000), "a fee must be deducted");
        assert!(moved > Amount::from_sat(99_000), "only a minimal fee");

        // A second chain now exists and the destination key is on it.
        wallet.with_keys(|keys| {
            assert_eq!(keys.chains().len(), 2);
            assert!(keys.is_mine(&rotation.output[0].script_pubkey));
        });

        // The rotation tx is committed as self-originated pending spend.
        let txid = rotation.compute_txid();
        assert_eq!(wallet.pool_of(&txid), Some(Pool::Pending));
        assert_eq!(
            wallet.confidence_table().source(&txid),
            crate::confidence::Source::Own
        );
        assert_eq!(wallet.balance(BalanceType::Estimated), moved);
        assert!(wallet.is_consistent());
    }

    #[test]
    fn test_rotation_ignores_pending_coins() {
        let wallet = test_wallet_created_at(1_000);
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 2);
        wallet.receive_pending(&funding, &[]).expect("pending should succeed");

        let chain_created =
            wallet.with_keys(|keys| keys.active_chain().creation_time());
        wallet
            .set_key_rotation_time(Some(chain_created + 1))
            .expect("setting rotation time should succeed");

        let made = wallet.do_maintenance(None, true).expect("maintenance should succeed");
        assert!(made.is_empty(), "unconfirmed coins must not be rotated");
    }

    #[test]
    fn test_encrypted_rotation_requires_password() {
        let wallet = test_wallet_created_at(1_000);
        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 3);
        confirm(&wallet, &funding, block(10, 0xC1));

        wallet.with_keys(|keys| {
            keys.encrypt(std::sync::Arc::new(StubCrypter), b"password")
                .expect("encrypt should succeed")
        });
        let chain_created =
            wallet.with_keys(|keys| keys.active_chain().creation_time());
        wallet
            .set_key_rotation_time(Some(chain_created + 1))
            .expect("setting rotation time should succeed");

        let err = wallet
            .do_maintenance(None, true)
            .expect_err("maintenance without password should fail");
        assert!(matches!(
            err,
            Error::Key(KeyError::DeterministicUpgradeRequiresPassword)
        ));

        let made = wallet
            .do_maintenance(Some(b"password"), true)
            .expect("maintenance with password should succeed");
        assert_eq!(made.len(), 1);
    }

    #[test]
    fn test_fresh_keys_are_not_swept() {
        let wallet = test_wallet();
        let chain_created =
            wallet.with_keys(|keys| keys.active_chain().creation_time());
        wallet
            .set_key_rotation_time(Some(chain_created.saturating_sub(100)))
            .expect("setting rotation time should succeed");

        let funding = funding_tx(&wallet, Amount::from_sat(100_000), 4);
        confirm(&wallet, &funding, block(10, 0xC2));

        let made = wallet.do_maintenance(None, true).expect("maintenance should succeed");
        assert!(made.is_empty());
        // The active chain is younger than the threshold; no synthesis.
        wallet.with_keys(|keys| {
            let _ = keys.find_redeem_data(&[0u8; 20]);
            assert_eq!(keys.chains().len(), 1);
        });
    }
}
