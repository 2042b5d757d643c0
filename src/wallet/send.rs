//! Payment assembly
//!
//! A send starts as a [`SendRequest`] carrying the recipient outputs and
//! policy knobs. Completion selects coins through the pluggable selector,
//! iterates the fee until it covers the signed size, adds change (or
//! folds dust change into the fee), drives the signer chain, and enforces
//! standardness limits. The canonical fee loop: guess a fee, build the
//! candidate transaction, compute the fee its size requires, and repeat
//! until the guess is sufficient. Required fees are monotone
//! non-decreasing, so the loop reaches a fixed point quickly.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::{Wallet, WalletInner};
use crate::broadcast::Broadcast;
use crate::coinselect::{CoinSelection, CoinSelector, SpendCandidate};
use crate::confidence::Source;
use crate::errors::{BuildError, Error, KeyError, Result};
use crate::keys::{DecryptingKeyBag, KeyBag, KeyChainGroup};
use crate::signer::{MissingSigsMode, ProposedTransaction, DUMMY_SIGNATURE_LEN};
use crate::types::{
    classify_script, is_dust, min_non_dust, ScriptKind, TxPurpose, MAX_STANDARD_TX_SIZE,
    REFERENCE_MIN_FEE_PER_KB,
};

/// Upper bound on fee-loop iterations; the sequence of required fees is
/// monotone and bounded, so hitting this means a selector is misbehaving.
const MAX_FEE_ITERATIONS: usize = 20;

/// Worst-case signature push, DER encoded with the sighash byte.
const ESTIMATED_SIG_BYTES: u64 = 75;
/// Compressed public key push.
const COMPRESSED_PUBKEY_PUSH: u64 = 34;

/// A payment under construction.
pub struct SendRequest {
    /// The transaction skeleton: recipient outputs, optionally pre-chosen
    /// inputs. Completion fills in the rest.
    pub tx: Transaction,
    /// Fee rate in satoshis per 1000 virtual bytes.
    pub fee_per_kb: Amount,
    /// Raise the rate to the reference minimum and refuse dust outputs.
    pub ensure_min_required_fee: bool,
    /// Send everything: a single output shrunk by the fee in one shot.
    pub empty_wallet: bool,
    /// Where change goes; the current change script if unset.
    pub change_script: Option<ScriptBuf>,
    /// Overrides the wallet's coin selector for this request.
    pub coin_selector: Option<Arc<dyn CoinSelector>>,
    /// Shuffle outputs to obscure which one is change.
    pub shuffle_outputs: bool,
    /// Run the signer chain as part of completion.
    pub sign_inputs: bool,
    /// Deduct the fee from the recipients instead of adding it on top.
    pub recipients_pay_fees: bool,
    /// What to leave where a signature could not be produced.
    pub missing_sigs_mode: MissingSigsMode,
    /// Decryption key for encrypted wallets.
    pub user_key: Option<Vec<u8>>,
    /// Set once completion succeeds; a completed request is immutable.
    pub completed: bool,
}

impl SendRequest {
    fn empty_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    /// A payment of `value` to `script`.
    pub fn to(script: ScriptBuf, value: Amount) -> Self {
        let mut tx = Self::empty_tx();
        tx.output.push(TxOut { value, script_pubkey: script });
        Self::for_tx(tx)
    }

    /// Sends the wallet's entire spendable balance to `script`.
    pub fn empty_wallet_to(script: ScriptBuf) -> Self {
        let mut tx = Self::empty_tx();
        tx.output.push(TxOut { value: Amount::ZERO, script_pubkey: script });
        let mut req = Self::for_tx(tx);
        req.empty_wallet = true;
        req
    }

    /// Wraps a caller-built transaction skeleton.
    pub fn for_tx(tx: Transaction) -> Self {
        Self {
            tx,
            fee_per_kb: REFERENCE_MIN_FEE_PER_KB,
            ensure_min_required_fee: true,
            empty_wallet: false,
            change_script: None,
            coin_selector: None,
            shuffle_outputs: true,
            sign_inputs: true,
            recipients_pay_fees: false,
            missing_sigs_mode: MissingSigsMode::default(),
            user_key: None,
            completed: false,
        }
    }
}

/// Result of one successful run of the fee loop.
pub(crate) struct FeeCalculation {
    pub(crate) selection: CoinSelection,
    pub(crate) change_output: Option<TxOut>,
    pub(crate) updated_output_values: Option<Vec<Amount>>,
    pub(crate) fee: Amount,
}

impl Wallet {
    /// Completes a send request: selects coins, computes the fee, adds
    /// change, signs, and checks standardness. On error the wallet is
    /// unchanged and the request untouched except for scratch state.
    pub fn complete(&self, req: &mut SendRequest) -> Result<()> {
        if req.completed {
            return Err(Error::Consistency("send request has already been completed".into()));
        }
        let connected = {
            let inner = self.inner.lock();
            let mut keys = self.keys.lock();
            info!(
                outputs = req.tx.output.len(),
                fee_per_kb = %req.fee_per_kb,
                "completing send"
            );

            let mut all_candidates = self.spend_candidates_locked(&inner, &keys, true);
            if req.missing_sigs_mode == MissingSigsMode::Throw {
                all_candidates.retain(|c| {
                    keys.find_key_for_script(&c.script_pubkey)
                        .map(|k| k.has_secret())
                        .unwrap_or(false)
                });
            }

            // Value of pre-supplied inputs we can recognize.
            let mut total_input = Amount::ZERO;
            for input in &req.tx.input {
                match all_candidates.iter().find(|c| c.outpoint == input.previous_output) {
                    Some(candidate) => total_input += candidate.value,
                    None => warn!(
                        outpoint = %input.previous_output,
                        "pre-supplied input of unknown value, it will be added to the fee"
                    ),
                }
            }
            let total_output: Amount = req.tx.output.iter().map(|o| o.value).sum();
            let value_needed = total_output.checked_sub(total_input).unwrap_or(Amount::ZERO);

            if req.tx.output.iter().filter(|o| o.script_pubkey.is_op_return()).count() > 1 {
                return Err(BuildError::MultipleOpReturn.into());
            }
            if req.ensure_min_required_fee
                && !req.empty_wallet
                && req.tx.output.iter().any(|o| is_dust(o.value, &o.script_pubkey))
            {
                return Err(BuildError::Dusty.into());
            }

            let candidates: Vec<SpendCandidate> = all_candidates
                .into_iter()
                .filter(|c| {
                    !req.tx.input.iter().any(|i| i.previous_output == c.outpoint)
                })
                .collect();

            let fee_calc = if req.empty_wallet {
                if req.tx.output.len() != 1 {
                    return Err(Error::Consistency(
                        "an empty-wallet send must have exactly one output".into(),
                    ));
                }
                let selector = self.request_selector(req);
                let selection = selector.select(Amount::MAX_MONEY, candidates);
                req.tx.output[0].value = selection.total();
                info!(total = %selection.total(), "emptying wallet");
                FeeCalculation {
                    selection,
                    change_output: None,
                    updated_output_values: None,
                    fee: Amount::ZERO,
                }
            } else {
                self.calculate_fee(&mut keys, req, value_needed, &candidates)?
            };
            debug!(fee = %fee_calc.fee, inputs = fee_calc.selection.selected.len(), "fee settled");

            for candidate in &fee_calc.selection.selected {
                req.tx.input.push(TxIn {
                    previous_output: candidate.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                });
            }

            if req.empty_wallet
                && !self.adjust_output_downwards(
                    &keys,
                    &mut req.tx,
                    &fee_calc.selection,
                    req.fee_per_kb,
                    req.ensure_min_required_fee,
                )?
            {
                let script = req.tx.output[0].script_pubkey.clone();
                return Err(BuildError::CouldNotAdjustDownwards {
                    value: req.tx.output[0].value,
                    min_non_dust: min_non_dust(&script),
                }
                .into());
            }

            if let Some(updated) = &fee_calc.updated_output_values {
                for (i, value) in updated.iter().enumerate() {
                    req.tx.output[i].value = *value;
                }
            }
            if let Some(change) = fee_calc.change_output.clone() {
                info!(change = %change.value, "adding change output");
                req.tx.output.push(change);
            }
            if req.shuffle_outputs {
                req.tx.output.shuffle(&mut rand::thread_rng());
            }

            // Snapshot the outputs each input spends for the signer chain.
            let mut connected: HashMap<OutPoint, TxOut> = HashMap::new();
            for input in &req.tx.input {
                if let Some(output) = inner.store.output_of(&input.previous_output) {
                    connected.insert(input.previous_output, output.clone());
                }
            }
            connected
        };

        if req.sign_inputs {
            self.sign_request_with(req, &connected)?;
        }

        let size = req.tx.total_size();
        if size > MAX_STANDARD_TX_SIZE {
            return Err(BuildError::ExceededMaxTxSize { size }.into());
        }

        // Self-created: its change can be respent before it confirms.
        let txid = req.tx.compute_txid();
        self.confidence.set_source(txid, Source::Own);
        req.completed = true;
        info!(%txid, "send completed");
        Ok(())
    }

    /// Completes, commits and broadcasts a request. The broadcast handle
    /// completes when the network layer reports send and relay; the
    /// wallet lock is never held across either await.
    pub fn send_coins(&self, mut req: SendRequest) -> Result<(Transaction, Broadcast)> {
        let broadcaster = self
            .broadcaster()
            .ok_or_else(|| Error::Consistency("no broadcaster installed".into()))?;
        self.complete(&mut req)?;
        let tx = req.tx.clone();
        self.maybe_commit_with_purpose(tx.clone(), TxPurpose::UserPayment)?;
        let handle = broadcaster.broadcast(&tx);
        Ok((tx, handle))
    }

    fn request_selector(&self, req: &SendRequest) -> Arc<dyn CoinSelector> {
        req.coin_selector.clone().unwrap_or_else(|| self.coin_selector.lock().clone())
    }

    /// The fee loop. `value_needed` is the recipient total minus any
    /// pre-supplied input value.
    pub(crate) fn calculate_fee(
        &self,
        keys: &mut KeyChainGroup,
        req: &SendRequest,
        value_needed: Amount,
        candidates: &[SpendCandidate],
    ) -> Result<FeeCalculation> {
        let mut fee = Amount::ZERO;
        for _ in 0..MAX_FEE_ITERATIONS {
            let mut tx = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: req.tx.input.clone(),
                output: Vec::new(),
            };
            let mut updated_output_values =
                if req.recipients_pay_fees { Some(Vec::new()) } else { None };
            let target =
                if req.recipients_pay_fees { value_needed } else { value_needed + fee };

            let output_count = req.tx.output.len() as u64;
            for (i, original) in req.tx.output.iter().enumerate() {
                let mut output = original.clone();
                if let Some(updated) = updated_output_values.as_mut() {
                    // Fee is shared equally; the first recipient also
                    // carries the remainder of the division.
                    let mut share = fee.to_sat() / output_count;
                    if i == 0 {
                        share += fee.to_sat() % output_count;
                    }
                    let min = min_non_dust(&output.script_pubkey);
                    output.value = output
                        .value
                        .checked_sub(Amount::from_sat(share))
                        .filter(|v| !is_dust(*v, &output.script_pubkey))
                        .ok_or(BuildError::CouldNotAdjustDownwards {
                            value: output.value,
                            min_non_dust: min,
                        })?;
                    updated.push(output.value);
                }
                tx.output.push(output);
            }

            let selector = self.request_selector(req);
            let selection = selector.select(target, candidates.to_vec());
            let total = selection.total();
            if total < target {
                return Err(BuildError::InsufficientFunds {
                    missing: target - total,
                    available: total,
                    target: value_needed,
                    fee,
                }
                .into());
            }

            let change = total - target;
            let mut change_output = None;
            if change > Amount::ZERO {
                let change_script = match &req.change_script {
                    Some(script) => script.clone(),
                    None => keys.current_change_script()?,
                };
                let mut output = TxOut { value: change, script_pubkey: change_script };
                if req.recipients_pay_fees && is_dust(output.value, &output.script_pubkey) {
                    // Moving dust change into the fee would make senders
                    // pay more than requested; raise the change and deduct
                    // from the first recipient instead.
                    let shortfall = min_non_dust(&output.script_pubkey) - output.value;
                    output.value += shortfall;
                    let first = &mut tx.output[0];
                    let min = min_non_dust(&first.script_pubkey);
                    first.value = first
                        .value
                        .checked_sub(shortfall)
                        .filter(|v| !is_dust(*v, &first.script_pubkey))
                        .ok_or(BuildError::CouldNotAdjustDownwards {
                            value: first.value,
                            min_non_dust: min,
                        })?;
                    if let Some(updated) = updated_output_values.as_mut() {
                        updated[0] = first.value;
                    }
                }
                if is_dust(output.value, &output.script_pubkey) {
                    // Never create dust change; fold it into the fee.
                    fee += output.value;
                } else {
                    tx.output.push(output.clone());
                    change_output = Some(output);
                }
            }

            for candidate in &selection.selected {
                tx.input.push(TxIn {
                    previous_output: candidate.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                });
            }

            let fee_needed = self.estimate_fee(
                keys,
                &tx,
                &selection,
                req.fee_per_kb,
                req.ensure_min_required_fee,
            )?;
            debug!(%fee, %fee_needed, "fee iteration");
            if fee >= fee_needed {
                return Ok(FeeCalculation {
                    selection,
                    change_output,
                    updated_output_values,
                    fee,
                });
            }
            fee = fee_needed;
        }
        Err(Error::Consistency("fee iteration did not reach a fixed point".into()))
    }

    /// Required fee for `tx` once the selected inputs are signed:
    /// fee-per-kvB times the estimated virtual size, rounded up.
    fn estimate_fee(
        &self,
        keys: &KeyChainGroup,
        tx: &Transaction,
        selection: &CoinSelection,
        fee_per_kb: Amount,
        ensure_min_required_fee: bool,
    ) -> Result<Amount> {
        let rate = if ensure_min_required_fee && fee_per_kb < REFERENCE_MIN_FEE_PER_KB {
            REFERENCE_MIN_FEE_PER_KB
        } else {
            fee_per_kb
        };
        let mut vsize = tx.vsize() as u64;
        for candidate in &selection.selected {
            vsize += Self::signing_vbytes(keys, candidate)?;
        }
        Ok(Amount::from_sat((rate.to_sat() * vsize).div_ceil(1000)))
    }

    /// Virtual bytes the unlocking data of one selected output will add
    /// once signed, by script type.
    fn signing_vbytes(keys: &KeyChainGroup, candidate: &SpendCandidate) -> Result<u64> {
        let script = &candidate.script_pubkey;
        match classify_script(script) {
            ScriptKind::P2pkh(_) | ScriptKind::P2pk(_) => {
                if keys.find_key_for_script(script).is_none() {
                    return Err(Error::Consistency(
                        "coin selection includes an unspendable output".into(),
                    ));
                }
                Ok(ESTIMATED_SIG_BYTES + COMPRESSED_PUBKEY_PUSH)
            }
            ScriptKind::P2wpkh(_) => {
                if keys.find_key_for_script(script).is_none() {
                    return Err(Error::Consistency(
                        "coin selection includes an unspendable output".into(),
                    ));
                }
                // Witness data weighs a quarter of base data.
                Ok((ESTIMATED_SIG_BYTES + COMPRESSED_PUBKEY_PUSH).div_ceil(4))
            }
            ScriptKind::P2sh(hash) => {
                let redeem = keys
                    .find_redeem_data(&hash)
                    .ok_or_else(|| {
                        Error::Consistency("coin selection includes an unspendable output".into())
                    })?
                    .redeem_script;
                let m = crate::signer::LocalSigner::required_signatures(&redeem);
                let redeem_push =
                    if redeem.len() <= 75 { 1 } else { 2 } + redeem.len() as u64;
                Ok(1 + m as u64 * ESTIMATED_SIG_BYTES + redeem_push)
            }
            ScriptKind::OpReturn | ScriptKind::Other => Ok(ESTIMATED_SIG_BYTES),
        }
    }

    /// Shrinks the single output of an empty-wallet transaction by the
    /// required fee. Returns false when the result would be dust.
    pub(crate) fn adjust_output_downwards(
        &self,
        keys: &KeyChainGroup,
        tx: &mut Transaction,
        selection: &CoinSelection,
        fee_per_kb: Amount,
        ensure_min_required_fee: bool,
    ) -> Result<bool> {
        let fee = self.estimate_fee(keys, tx, selection, fee_per_kb, ensure_min_required_fee)?;
        let total = selection.total();
        let value = match total.checked_sub(fee) {
            Some(value) => value,
            None => return Ok(false),
        };
        if is_dust(value, &tx.output[0].script_pubkey) {
            tx.output[0].value = value;
            return Ok(false);
        }
        tx.output[0].value = value;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Signing
    // ------------------------------------------------------------------

    /// Runs the signer chain over a request whose inputs are connected to
    /// tracked outputs.
    ///
    /// # Errors
    /// [`KeyError::BadEncryptionKey`] if the supplied user key is wrong;
    /// [`KeyError::MissingPrivateKey`] in
    /// [`MissingSigsMode::Throw`] when a signature is missing afterwards.
    pub fn sign_request(&self, req: &mut SendRequest) -> Result<()> {
        let connected = {
            let inner = self.inner.lock();
            Self::connected_outputs(&inner, &req.tx)
        };
        self.sign_request_with(req, &connected)
    }

    pub(crate) fn connected_outputs(
        inner: &WalletInner,
        tx: &Transaction,
    ) -> HashMap<OutPoint, TxOut> {
        let mut connected = HashMap::new();
        for input in &tx.input {
            if let Some(output) = inner.store.output_of(&input.previous_output) {
                connected.insert(input.previous_output, output.clone());
            }
        }
        connected
    }

    pub(crate) fn sign_request_with(
        &self,
        req: &mut SendRequest,
        connected: &HashMap<OutPoint, TxOut>,
    ) -> Result<()> {
        let keys = self.keys.lock();
        if keys.is_encrypted() {
            if let Some(user_key) = &req.user_key {
                keys.verify_user_key(user_key)?;
            }
        }
        let crypter = keys.crypter().cloned();
        let bag = DecryptingKeyBag::new(
            &*keys,
            crypter.as_deref(),
            req.user_key.as_deref(),
        );

        let mut proposal = ProposedTransaction::new(req.tx.clone());
        proposal.connected = connected.clone();

        let signers = self.signers.lock().clone();
        for signer in signers {
            if !signer.is_ready() {
                info!("skipping unready signer");
                continue;
            }
            if !signer.sign_inputs(&mut proposal, &bag) {
                info!("a signer returned false for the transaction");
            }
        }

        // Resolve anything still unsigned according to the request policy.
        let mut unsigned: Vec<usize> = Vec::new();
        for i in 0..proposal.tx.input.len() {
            let Some(output) = proposal.connected_output(i).cloned() else { continue };
            if !self.verifier.correctly_spends(
                &proposal.tx,
                i,
                &output.script_pubkey,
                output.value,
            ) {
                unsigned.push(i);
            }
        }
        for i in unsigned {
            match req.missing_sigs_mode {
                MissingSigsMode::UseOpZero => {
                    // Empty pushes already stand where signatures belong.
                }
                MissingSigsMode::UseDummySig => {
                    let output = proposal
                        .connected_output(i)
                        .cloned()
                        .expect("unsigned inputs are connected by construction");
                    Self::apply_dummy_signature(&mut proposal.tx.input[i], &output);
                }
                MissingSigsMode::Throw => return Err(KeyError::MissingPrivateKey.into()),
            }
        }

        req.tx = proposal.tx;
        Ok(())
    }

    fn apply_dummy_signature(input: &mut TxIn, output: &TxOut) {
        let dummy_sig = vec![0u8; DUMMY_SIGNATURE_LEN];
        let dummy_key = vec![0u8; 33];
        match classify_script(&output.script_pubkey) {
            ScriptKind::P2wpkh(_) => {
                input.script_sig = ScriptBuf::new();
                let mut witness = Witness::new();
                witness.push(&dummy_sig);
                witness.push(&dummy_key);
                input.witness = witness;
            }
            _ => {
                let mut builder = bitcoin::script::Builder::new();
                if let Ok(push) = bitcoin::script::PushBytesBuf::try_from(dummy_sig) {
                    builder = builder.push_slice(push);
                }
                if let Ok(push) = bitcoin::script::PushBytesBuf::try_from(dummy_key) {
                    builder = builder.push_slice(push);
                }
                input.script_sig = builder.into_script();
                input.witness = Witness::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Amount;

    use super::super::test_support::*;
    use super::*;
    use crate::errors::BuildError;
    use crate::types::{BalanceType, Pool};

    fn fund(wallet: &Wallet, value: u64, salt: u8, height: u32) -> Transaction {
        let tx = funding_tx(wallet, Amount::from_sat(value), salt);
        confirm(wallet, &tx, block(height, salt));
        tx
    }

    #[test]
    fn test_complete_adds_change_and_signs() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 1, 10);

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(50_000));
        wallet.complete(&mut req).expect("complete should succeed");

        assert!(req.completed);
        assert_eq!(req.tx.output.len(), 2);
        let recipient_total: Amount = req
            .tx
            .output
            .iter()
            .filter(|o| o.script_pubkey == foreign_script())
            .map(|o| o.value)
            .sum();
        assert_eq!(recipient_total, Amount::from_sat(50_000));

        let outputs_total: Amount = req.tx.output.iter().map(|o| o.value).sum();
        let fee = Amount::from_sat(100_000) - outputs_total;
        // One P2WPKH input, two P2WPKH outputs: about 140 virtual bytes.
        let vsize = req.tx.vsize();
        assert!((130..=150).contains(&vsize), "unexpected vsize {vsize}");
        assert!(fee >= Amount::from_sat(vsize as u64 * 1_000 / 1_000 - 5));
        assert!(fee <= Amount::from_sat(160), "fee too large: {fee}");

        // Every input carries a witness signature.
        assert!(req.tx.input.iter().all(|i| i.witness.len() == 2));
    }

    #[test]
    fn test_complete_then_commit_spends_change_chain() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 2, 10);

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(30_000));
        wallet.complete(&mut req).expect("complete should succeed");
        let txid = req.tx.compute_txid();
        wallet.commit(req.tx).expect("commit should succeed");

        assert_eq!(wallet.pool_of(&txid), Some(Pool::Pending));
        assert_eq!(wallet.confidence_table().source(&txid), crate::confidence::Source::Own);
        // The change output is ours and spendable once propagated.
        assert_eq!(wallet.my_unspents().len(), 1);
        assert!(wallet.is_consistent());
    }

    #[test]
    fn test_insufficient_funds() {
        let wallet = test_wallet();
        fund(&wallet, 10_000, 3, 10);

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(50_000));
        let err = wallet.complete(&mut req).expect_err("complete should fail");

        match err {
            crate::errors::Error::Build(BuildError::InsufficientFunds {
                missing,
                available,
                ..
            }) => {
                assert!(missing > Amount::ZERO);
                assert_eq!(available, Amount::from_sat(10_000));
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
        assert!(!req.completed);
    }

    #[test]
    fn test_unconfirmed_foreign_coins_are_not_spendable() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, Amount::from_sat(100_000), 4);
        wallet.receive_pending(&tx, &[]).expect("pending should succeed");
        assert_eq!(wallet.balance(BalanceType::Estimated), Amount::from_sat(100_000));

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(50_000));
        let err = wallet.complete(&mut req).expect_err("complete should fail");
        assert!(matches!(
            err,
            crate::errors::Error::Build(BuildError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_dusty_send_rejected() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 5, 10);

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(100));
        let err = wallet.complete(&mut req).expect_err("complete should fail");
        assert!(matches!(err, crate::errors::Error::Build(BuildError::Dusty)));
    }

    #[test]
    fn test_multiple_op_return_rejected() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 6, 10);

        let mut tx = SendRequest::to(foreign_script(), Amount::from_sat(10_000)).tx;
        tx.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(*b"one"),
        });
        tx.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(*b"two"),
        });
        let mut req = SendRequest::for_tx(tx);
        let err = wallet.complete(&mut req).expect_err("complete should fail");
        assert!(matches!(err, crate::errors::Error::Build(BuildError::MultipleOpReturn)));
    }

    #[test]
    fn test_empty_wallet_send() {
        let wallet = test_wallet();
        fund(&wallet, 10_000, 7, 10);

        let mut req = SendRequest::empty_wallet_to(foreign_script());
        req.fee_per_kb = Amount::from_sat(2_000);
        wallet.complete(&mut req).expect("complete should succeed");

        assert_eq!(req.tx.output.len(), 1);
        let value = req.tx.output[0].value;
        let fee = Amount::from_sat(10_000) - value;
        // One P2WPKH input and output: about 110 virtual bytes at
        // 2 sat/vbyte.
        assert!(fee >= Amount::from_sat(200), "fee too small: {fee}");
        assert!(fee <= Amount::from_sat(260), "fee too large: {fee}");
    }

    #[test]
    fn test_empty_wallet_dust_result_fails() {
        let wallet = test_wallet();
        fund(&wallet, 300, 8, 10);

        let mut req = SendRequest::empty_wallet_to(foreign_script());
        req.fee_per_kb = Amount::from_sat(2_000);
        let err = wallet.complete(&mut req).expect_err("complete should fail");
        assert!(matches!(
            err,
            crate::errors::Error::Build(BuildError::CouldNotAdjustDownwards { .. })
        ));
    }

    #[test]
    fn test_recipients_pay_fees() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 9, 10);

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(50_000));
        req.recipients_pay_fees = true;
        wallet.complete(&mut req).expect("complete should succeed");

        let recipient = req
            .tx
            .output
            .iter()
            .find(|o| o.script_pubkey == foreign_script())
            .expect("recipient output present");
        // The fee came out of the recipient's value.
        assert!(recipient.value < Amount::from_sat(50_000));
        let outputs_total: Amount = req.tx.output.iter().map(|o| o.value).sum();
        let change: Amount = outputs_total - recipient.value;
        // Change plus recipient plus fee equals the single funding coin.
        assert_eq!(
            change + Amount::from_sat(50_000),
            Amount::from_sat(100_000),
            "change must absorb everything except the requested value"
        );
    }

    #[test]
    fn test_fee_iteration_settles_quickly() {
        let wallet = test_wallet();
        // Many small coins force multi-input selections and at least one
        // fee-loop repeat.
        for i in 0..8u8 {
            fund(&wallet, 15_000, 20 + i, 10 + u32::from(i));
        }

        let mut req = SendRequest::to(foreign_script(), Amount::from_sat(100_000));
        wallet.complete(&mut req).expect("complete should succeed");

        let inputs_total = Amount::from_sat(15_000) * req.tx.input.len() as u64;
        let outputs_total: Amount = req.tx.output.iter().map(|o| o.value).sum();
        let fee = inputs_total - outputs_total;
        assert!(fee > Amount::ZERO);
        let vsize = req.tx.vsize() as u64;
        assert!(fee >= Amount::from_sat(vsize - 10));
    }

    #[test]
    fn test_missing_sigs_lenient_mode_leaves_foreign_input() {
        let wallet = test_wallet();
        fund(&wallet, 100_000, 30, 10);

        // A foreign pre-supplied input cannot be signed locally.
        let mut tx = SendRequest::to(foreign_script(), Amount::from_sat(10_000)).tx;
        tx.input.push(TxIn {
            previous_output: bitcoin::OutPoint {
                txid: bitcoin::Txid::from_raw_hash(bitcoin::hashes::Hash::all_zeros()),
                vout: 7,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        let mut req = SendRequest::for_tx(tx);
        req.missing_sigs_mode = MissingSigsMode::UseOpZero;
        wallet.complete(&mut req).expect("lenient mode should succeed");
        // The foreign input is left untouched for some other signer.
        assert!(req.tx.input.iter().any(|i| i.witness.is_empty() && i.script_sig.is_empty()));
    }
}
