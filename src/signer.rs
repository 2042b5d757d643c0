//! The transaction signer chain
//!
//! A proposed transaction is passed through an ordered list of signers,
//! each contributing what it can. The built-in [`LocalSigner`] signs
//! everything the key bag has private material for; external signers
//! (hardware devices, cosigning services) can be appended to the chain
//! and pick up the derivation paths the local signer records on the
//! proposal.
//!
//! Script execution itself is a collaborator behind [`ScriptVerifier`];
//! the built-in [`StructuralVerifier`] only checks that an input's
//! scriptSig/witness has the shape its scriptPubKey demands, which is
//! enough to decide "already signed, leave it alone".

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::bip32::DerivationPath;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Amount, OutPoint, PublicKey, Script, ScriptBuf, Transaction, TxOut, Witness,
};
use tracing::{debug, warn};

use crate::keys::{KeyBag, KeyHandle, RedeemData, ScriptType};
use crate::types::{classify_script, ScriptKind};

/// What to leave in place of signatures the chain could not produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingSigsMode {
    /// Leave an empty push; the standard placeholder in partially signed
    /// multisig scripts.
    #[default]
    UseOpZero,
    /// Insert a max-size dummy signature, for fee estimation.
    UseDummySig,
    /// Fail the completing call instead.
    Throw,
}

/// A worst-case-size stand-in for a DER signature plus sighash byte.
pub const DUMMY_SIGNATURE_LEN: usize = 72;

/// A transaction being signed, with the context signers need.
pub struct ProposedTransaction {
    /// The partially signed transaction.
    pub tx: Transaction,
    /// The output each input spends, for script and value lookup.
    pub connected: HashMap<OutPoint, TxOut>,
    /// Derivation path of the signing key per scriptPubKey, recorded by
    /// the first signer so downstream cosigners derive the same branch.
    pub key_paths: HashMap<ScriptBuf, DerivationPath>,
}

impl ProposedTransaction {
    /// Wraps a transaction for the signer chain.
    pub fn new(tx: Transaction) -> Self {
        Self { tx, connected: HashMap::new(), key_paths: HashMap::new() }
    }

    /// Records the output that `outpoint` resolves to.
    pub fn connect(&mut self, outpoint: OutPoint, output: TxOut) {
        self.connected.insert(outpoint, output);
    }

    /// The output the input at `index` spends, if known.
    pub fn connected_output(&self, index: usize) -> Option<&TxOut> {
        self.tx.input.get(index).and_then(|i| self.connected.get(&i.previous_output))
    }
}

/// One stage of the signer chain.
pub trait TransactionSigner: Send + Sync {
    /// Whether the signer has everything it needs (keys unlocked, device
    /// connected). Unready signers are skipped.
    fn is_ready(&self) -> bool;

    /// Signs whatever inputs this signer can. Returns false if the signer
    /// wanted to contribute but failed.
    fn sign_inputs(&self, proposal: &mut ProposedTransaction, key_bag: &dyn KeyBag) -> bool;
}

/// Script-execution collaborator deciding whether an input already spends
/// its output correctly.
pub trait ScriptVerifier: Send + Sync {
    /// Whether input `index` of `tx` correctly spends an output locked by
    /// `script_pubkey` holding `value`. Implementations run with P2SH and
    /// NULLDUMMY rules only, so any SIGHASH mode is accepted.
    fn correctly_spends(
        &self,
        tx: &Transaction,
        index: usize,
        script_pubkey: &Script,
        value: Amount,
    ) -> bool;
}

/// Shape-only verification: no script execution, just "does the unlocking
/// data look complete for this output type".
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralVerifier;

impl StructuralVerifier {
    fn pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for instruction in script.instructions() {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) => out.push(bytes.as_bytes().to_vec()),
                Ok(Instruction::Op(_)) => return None,
                Err(_) => return None,
            }
        }
        Some(out)
    }
}

impl ScriptVerifier for StructuralVerifier {
    fn correctly_spends(
        &self,
        tx: &Transaction,
        index: usize,
        script_pubkey: &Script,
        _value: Amount,
    ) -> bool {
        let Some(input) = tx.input.get(index) else { return false };
        match classify_script(script_pubkey) {
            ScriptKind::P2pkh(_) => match Self::pushes(&input.script_sig) {
                Some(pushes) => pushes.len() == 2 && pushes.iter().all(|p| !p.is_empty()),
                None => false,
            },
            ScriptKind::P2pk(_) => match Self::pushes(&input.script_sig) {
                Some(pushes) => pushes.len() == 1 && !pushes[0].is_empty(),
                None => false,
            },
            ScriptKind::P2wpkh(_) => {
                input.script_sig.is_empty()
                    && input.witness.len() == 2
                    && input.witness.iter().all(|item| !item.is_empty())
            }
            ScriptKind::P2sh(_) => match Self::pushes(&input.script_sig) {
                // Fully signed multisig: one NULLDUMMY empty push at most,
                // every signature slot filled, redeem script last.
                Some(pushes) if pushes.len() >= 2 => {
                    let empties = pushes.iter().filter(|p| p.is_empty()).count();
                    empties <= 1 && !pushes.last().map(|p| p.is_empty()).unwrap_or(true)
                }
                _ => false,
            },
            // An output type we cannot read: if any unlocking data is
            // present, assume a signer we don't understand produced it.
            ScriptKind::OpReturn | ScriptKind::Other =>
                !input.script_sig.is_empty() || !input.witness.is_empty(),
        }
    }
}

/// Signs inputs with keys from the provided key bag, always with
/// SIGHASH_ALL.
///
/// For P2SH inputs the derivation path of the signing key is recorded on
/// the proposal so later signers pick the matching branch; this signer
/// always places its signature first and relies on later signers to
/// rearrange if needed.
pub struct LocalSigner {
    secp: Secp256k1<All>,
    verifier: Arc<dyn ScriptVerifier>,
}

impl Default for LocalSigner {
    fn default() -> Self { Self::new(Arc::new(StructuralVerifier)) }
}

impl LocalSigner {
    /// Creates a signer using `verifier` to skip already-signed inputs.
    pub fn new(verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self { secp: Secp256k1::new(), verifier }
    }

    fn find_signing_data(
        &self,
        key_bag: &dyn KeyBag,
        script_pubkey: &Script,
    ) -> Option<(KeyHandle, Option<RedeemData>)> {
        match classify_script(script_pubkey) {
            ScriptKind::P2pkh(hash) =>
                key_bag.find_key_by_pubkey_hash(&hash, ScriptType::P2pkh).map(|k| (k, None)),
            ScriptKind::P2pk(raw) => PublicKey::from_slice(&raw)
                .ok()
                .and_then(|pk| key_bag.find_key_by_pubkey(&pk))
                .map(|k| (k, None)),
            ScriptKind::P2wpkh(hash) =>
                key_bag.find_key_by_pubkey_hash(&hash, ScriptType::P2wpkh).map(|k| (k, None)),
            ScriptKind::P2sh(hash) => key_bag.find_redeem_data(&hash).and_then(|data| {
                data.full_key().cloned().map(|k| (k, Some(data)))
            }),
            ScriptKind::OpReturn | ScriptKind::Other => None,
        }
    }

    fn ecdsa_signature(
        &self,
        sighash: [u8; 32],
        key: &KeyHandle,
    ) -> Option<bitcoin::ecdsa::Signature> {
        let secret = match key.secret_key() {
            Ok(sk) => sk,
            Err(_) => return None,
        };
        // Low-R grinding keeps the encoded signature at 70 DER bytes, the
        // size fee estimation and the network's own signers assume.
        let signature = self.secp.sign_ecdsa_low_r(&Message::from_digest(sighash), &secret);
        Some(bitcoin::ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All })
    }

    fn push(builder: Builder, bytes: &[u8]) -> Builder {
        match PushBytesBuf::try_from(bytes.to_vec()) {
            Ok(push) => builder.push_slice(push),
            Err(_) => builder,
        }
    }

    /// Number of signatures a redeem script demands: the m of an m-of-n
    /// CHECKMULTISIG, or one for anything else.
    pub(crate) fn required_signatures(redeem: &Script) -> usize {
        let bytes = redeem.as_bytes();
        let is_multisig = bytes.last() == Some(&0xae); // OP_CHECKMULTISIG
        match bytes.first() {
            Some(&op) if is_multisig && (0x51..=0x60).contains(&op) => (op - 0x50) as usize,
            _ => 1,
        }
    }
}

impl TransactionSigner for LocalSigner {
    fn is_ready(&self) -> bool { true }

    fn sign_inputs(&self, proposal: &mut ProposedTransaction, key_bag: &dyn KeyBag) -> bool {
        for i in 0..proposal.tx.input.len() {
            let Some(connected) = proposal.connected_output(i).cloned() else {
                warn!(input = i, "missing connected output, assuming input is already signed");
                continue;
            };
            if self.verifier.correctly_spends(&proposal.tx, i, &connected.script_pubkey, connected.value) {
                debug!(input = i, "input already correctly spends its output, skipping");
                continue;
            }
            let Some((key, redeem)) =
                self.find_signing_data(key_bag, &connected.script_pubkey)
            else {
                warn!(input = i, "no key found for input, leaving for other signers");
                continue;
            };
            if let Some(path) = &key.path {
                proposal.key_paths.insert(connected.script_pubkey.clone(), path.clone());
            }

            match classify_script(&connected.script_pubkey) {
                ScriptKind::P2pkh(_) | ScriptKind::P2pk(_) | ScriptKind::P2sh(_) => {
                    let script_code: ScriptBuf = match &redeem {
                        Some(data) => data.redeem_script.clone(),
                        None => connected.script_pubkey.clone(),
                    };
                    let sighash = {
                        let cache = SighashCache::new(&proposal.tx);
                        match cache.legacy_signature_hash(
                            i,
                            &script_code,
                            EcdsaSighashType::All.to_u32(),
                        ) {
                            Ok(hash) => hash.to_byte_array(),
                            Err(_) => {
                                warn!(input = i, "could not compute legacy sighash");
                                continue;
                            }
                        }
                    };
                    let Some(signature) = self.ecdsa_signature(sighash, &key) else {
                        warn!(input = i, "no private key in keypair for input");
                        continue;
                    };
                    let sig_bytes = signature.to_vec();
                    let script_sig = match &redeem {
                        None if matches!(
                            classify_script(&connected.script_pubkey),
                            ScriptKind::P2pk(_)
                        ) =>
                            Self::push(Builder::new(), &sig_bytes).into_script(),
                        None => {
                            let builder = Self::push(Builder::new(), &sig_bytes);
                            Self::push(builder, &key.pubkey.to_bytes()).into_script()
                        }
                        Some(data) => {
                            // NULLDUMMY slot, our signature first, empty
                            // slots for cosigners, then the redeem script.
                            let required = Self::required_signatures(&data.redeem_script);
                            let mut builder = Builder::new();
                            if required > 1 {
                                builder = builder
                                    .push_opcode(bitcoin::opcodes::all::OP_PUSHBYTES_0);
                            }
                            builder = Self::push(builder, &sig_bytes);
                            for _ in 1..required {
                                builder = builder
                                    .push_opcode(bitcoin::opcodes::all::OP_PUSHBYTES_0);
                            }
                            Self::push(builder, data.redeem_script.as_bytes()).into_script()
                        }
                    };
                    proposal.tx.input[i].script_sig = script_sig;
                    proposal.tx.input[i].witness = Witness::new();
                }
                ScriptKind::P2wpkh(_) => {
                    let sighash = {
                        let mut cache = SighashCache::new(&proposal.tx);
                        match cache.p2wpkh_signature_hash(
                            i,
                            &connected.script_pubkey,
                            connected.value,
                            EcdsaSighashType::All,
                        ) {
                            Ok(hash) => hash.to_byte_array(),
                            Err(_) => {
                                warn!(input = i, "could not compute segwit sighash");
                                continue;
                            }
                        }
                    };
                    let Some(signature) = self.ecdsa_signature(sighash, &key) else {
                        warn!(input = i, "no private key in keypair for input");
                        continue;
                    };
                    proposal.tx.input[i].script_sig = ScriptBuf::new();
                    proposal.tx.input[i].witness = Witness::p2wpkh(&signature, &key.pubkey.0);
                }
                ScriptKind::OpReturn | ScriptKind::Other => {}
            }
        }
        true
    }
}
