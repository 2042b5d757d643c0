//! The key chain group: every chain a wallet signs with
//!
//! A wallet usually has one active deterministic chain, but key rotation
//! can leave several older chains behind whose funds are being migrated.
//! The group answers ownership queries across all of them, owns the P2SH
//! redeem registry, and carries the encryption state for key material at
//! rest.

use std::collections::HashMap;
use std::sync::Arc;

use bip39::{Language, Mnemonic};
use bitcoin::hashes::Hash;
use bitcoin::{Network, PublicKey, Script, ScriptBuf};
use rand::RngCore;
use zeroize::Zeroizing;

use super::chain::{ChainStructure, DeterministicChain, EXTERNAL_BRANCH, INTERNAL_BRANCH};
use super::{KeyBag, KeyCrypter, KeyHandle, RedeemData, ScriptType};
use crate::errors::{KeyError, Result};
use crate::types::{classify_script, ScriptKind};

/// The set of deterministic chains and auxiliary key material a wallet
/// holds.
pub struct KeyChainGroup {
    network: Network,
    structure: ChainStructure,
    chains: Vec<DeterministicChain>,
    redeem_scripts: HashMap<[u8; 20], RedeemData>,
    crypter: Option<Arc<dyn KeyCrypter>>,
}

impl KeyChainGroup {
    /// Creates a group with one chain derived from a BIP39 mnemonic.
    pub fn from_mnemonic(
        phrase: &str,
        passphrase: &str,
        network: Network,
        structure: ChainStructure,
        script_type: ScriptType,
        creation_time: u64,
    ) -> Result<Self> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
            .map_err(|_| KeyError::Mnemonic)?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
        Self::from_seed(&seed[..], network, structure, script_type, creation_time)
    }

    /// Creates a group with one chain derived from raw seed entropy.
    pub fn from_seed(
        seed: &[u8],
        network: Network,
        structure: ChainStructure,
        script_type: ScriptType,
        creation_time: u64,
    ) -> Result<Self> {
        let chain =
            DeterministicChain::from_seed(seed, structure, script_type, network, creation_time)?;
        Ok(Self {
            network,
            structure,
            chains: vec![chain],
            redeem_scripts: HashMap::new(),
            crypter: None,
        })
    }

    /// Creates a group with one chain from fresh random entropy.
    pub fn from_random(
        network: Network,
        structure: ChainStructure,
        script_type: ScriptType,
        creation_time: u64,
    ) -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        Self::from_seed(&seed[..], network, structure, script_type, creation_time)
    }

    /// The network this group issues scripts for.
    pub fn network(&self) -> Network { self.network }

    /// The account layout used when synthesizing chains.
    pub fn structure(&self) -> ChainStructure { self.structure }

    /// The chain new keys are issued from (the most recently added).
    pub fn active_chain(&self) -> &DeterministicChain {
        self.chains.last().expect("a key chain group always holds at least one chain")
    }

    fn active_chain_mut(&mut self) -> &mut DeterministicChain {
        self.chains.last_mut().expect("a key chain group always holds at least one chain")
    }

    /// All chains, oldest first.
    pub fn chains(&self) -> &[DeterministicChain] { &self.chains }

    // ------------------------------------------------------------------
    // Script issuance
    // ------------------------------------------------------------------

    /// The current receive script; stable until the key is observed used.
    pub fn current_receive_script(&mut self) -> Result<ScriptBuf> {
        let chain = self.active_chain_mut();
        let key = chain.current_key(EXTERNAL_BRANCH)?;
        Ok(chain.script_of(&key))
    }

    /// Issues a fresh receive script.
    pub fn fresh_receive_script(&mut self) -> Result<ScriptBuf> {
        let chain = self.active_chain_mut();
        let key = chain.fresh_key(EXTERNAL_BRANCH)?;
        Ok(chain.script_of(&key))
    }

    /// The current change script, on the internal branch.
    pub fn current_change_script(&mut self) -> Result<ScriptBuf> {
        let chain = self.active_chain_mut();
        let key = chain.current_key(INTERNAL_BRANCH)?;
        Ok(chain.script_of(&key))
    }

    // ------------------------------------------------------------------
    // Ownership and lookup
    // ------------------------------------------------------------------

    /// Whether the wallet controls `script`.
    pub fn is_mine(&self, script: &Script) -> bool {
        match classify_script(script) {
            ScriptKind::P2pk(raw) => PublicKey::from_slice(&raw)
                .map(|pk| self.is_pubkey_mine(&pk))
                .unwrap_or(false),
            ScriptKind::P2pkh(hash) =>
                self.find_key_by_pubkey_hash(&hash, ScriptType::P2pkh).is_some(),
            ScriptKind::P2wpkh(hash) =>
                self.find_key_by_pubkey_hash(&hash, ScriptType::P2wpkh).is_some(),
            ScriptKind::P2sh(hash) => self.is_script_hash_mine(&hash),
            ScriptKind::OpReturn | ScriptKind::Other => false,
        }
    }

    /// The key controlling `script`, if the wallet has one.
    ///
    /// For P2SH scripts this is the first redeem key with private
    /// material.
    pub fn find_key_for_script(&self, script: &Script) -> Option<KeyHandle> {
        match classify_script(script) {
            ScriptKind::P2pk(raw) =>
                PublicKey::from_slice(&raw).ok().and_then(|pk| self.find_key_by_pubkey(&pk)),
            ScriptKind::P2pkh(hash) => self.find_key_by_pubkey_hash(&hash, ScriptType::P2pkh),
            ScriptKind::P2wpkh(hash) => self.find_key_by_pubkey_hash(&hash, ScriptType::P2wpkh),
            ScriptKind::P2sh(hash) =>
                self.find_redeem_data(&hash).and_then(|d| d.keys.into_iter().next()),
            ScriptKind::OpReturn | ScriptKind::Other => None,
        }
    }

    /// Creation time of the key controlling `script`, for rotation
    /// eligibility.
    pub fn key_creation_time_for_script(&self, script: &Script) -> Option<u64> {
        self.find_key_for_script(script).map(|k| k.creation_time)
    }

    // ------------------------------------------------------------------
    // Used-key bookkeeping
    // ------------------------------------------------------------------

    /// Marks the key with this public key as used.
    pub fn mark_pubkey_used(&mut self, pubkey: &PublicKey) {
        let hash = bitcoin::PubkeyHash::hash(&pubkey.to_bytes()).to_byte_array();
        self.mark_pubkey_hash_used(&hash);
    }

    /// Marks the key with this pubkey hash as used.
    pub fn mark_pubkey_hash_used(&mut self, hash: &[u8; 20]) {
        for chain in &mut self.chains {
            if chain.mark_hash_used(hash) {
                return;
            }
        }
    }

    /// Marks every key participating in the redeem script with this hash
    /// as used.
    pub fn mark_script_hash_used(&mut self, script_hash: &[u8; 20]) {
        let hashes: Vec<[u8; 20]> = match self.redeem_scripts.get(script_hash) {
            Some(data) =>
                data.keys.iter().map(|k| k.pubkey.pubkey_hash().to_byte_array()).collect(),
            None => return,
        };
        for hash in hashes {
            self.mark_pubkey_hash_used(&hash);
        }
    }

    /// Registers redeem data so P2SH outputs paying its hash are
    /// recognized and spendable.
    pub fn register_redeem_script(&mut self, redeem_script: ScriptBuf, keys: Vec<KeyHandle>) {
        let hash = redeem_script.script_hash().to_byte_array();
        self.redeem_scripts.insert(hash, RedeemData { redeem_script, keys });
    }

    // ------------------------------------------------------------------
    // Encryption at rest
    // ------------------------------------------------------------------

    /// Whether key material is currently encrypted.
    pub fn is_encrypted(&self) -> bool { self.crypter.is_some() }

    /// The installed crypter, when encrypted.
    pub fn crypter(&self) -> Option<&Arc<dyn KeyCrypter>> { self.crypter.as_ref() }

    /// Encrypts every chain's private material under `user_key`.
    pub fn encrypt(&mut self, crypter: Arc<dyn KeyCrypter>, user_key: &[u8]) -> Result<()> {
        for chain in &mut self.chains {
            chain.encrypt(crypter.as_ref(), user_key)?;
        }
        self.crypter = Some(crypter);
        Ok(())
    }

    /// Decrypts every chain's private material, removing the crypter.
    ///
    /// # Errors
    /// [`KeyError::BadEncryptionKey`] if `user_key` is wrong.
    pub fn decrypt(&mut self, user_key: &[u8]) -> Result<()> {
        let crypter = match self.crypter.clone() {
            Some(c) => c,
            None => return Ok(()),
        };
        for chain in &mut self.chains {
            chain.decrypt(crypter.as_ref(), user_key)?;
        }
        self.crypter = None;
        Ok(())
    }

    /// Checks `user_key` against the stored material without mutating it.
    pub fn verify_user_key(&self, user_key: &[u8]) -> Result<()> {
        if let Some(crypter) = &self.crypter {
            for chain in &self.chains {
                chain.verify_user_key(crypter.as_ref(), user_key)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rotation support
    // ------------------------------------------------------------------

    /// Whether every chain predates the rotation threshold.
    pub fn all_chains_rotating(&self, rotation_time: u64) -> bool {
        self.chains.iter().all(|c| c.is_rotating(rotation_time))
    }

    /// Adds a fresh random chain which becomes the active one.
    ///
    /// # Errors
    /// [`KeyError::DeterministicUpgradeRequiresPassword`] if the group is
    /// encrypted and no user key was supplied;
    /// [`KeyError::BadEncryptionKey`] if the supplied key is wrong.
    pub fn synthesize_fresh_chain(
        &mut self,
        script_type: ScriptType,
        user_key: Option<&[u8]>,
        creation_time: u64,
    ) -> Result<()> {
        let crypter = self.crypter.clone();
        let user_key = match (&crypter, user_key) {
            (Some(_), None) =>
                return Err(KeyError::DeterministicUpgradeRequiresPassword.into()),
            (Some(_), Some(key)) => {
                self.verify_user_key(key)?;
                Some(key)
            }
            (None, _) => None,
        };
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        let mut chain = DeterministicChain::from_seed(
            &seed[..],
            self.structure,
            script_type,
            self.network,
            creation_time,
        )?;
        if let (Some(crypter), Some(key)) = (&crypter, user_key) {
            chain.encrypt(crypter.as_ref(), key)?;
        }
        self.chains.push(chain);
        Ok(())
    }
}

impl KeyBag for KeyChainGroup {
    fn find_key_by_pubkey(&self, pubkey: &PublicKey) -> Option<KeyHandle> {
        self.chains.iter().find_map(|c| c.find_by_pubkey(pubkey))
    }

    fn find_key_by_pubkey_hash(
        &self,
        hash: &[u8; 20],
        script_type: ScriptType,
    ) -> Option<KeyHandle> {
        self.chains
            .iter()
            .filter(|c| c.script_type() == script_type)
            .find_map(|c| c.find_by_pubkey_hash(hash))
    }

    fn find_redeem_data(&self, script_hash: &[u8; 20]) -> Option<RedeemData> {
        self.redeem_scripts.get(script_hash).cloned()
    }

    fn earliest_key_creation_time(&self) -> Option<u64> {
        self.chains.iter().map(|c| c.creation_time()).min()
    }
}
