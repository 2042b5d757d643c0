//! A single BIP32 deterministic key chain
//!
//! Keys are derived below an account node in two unhardened branches:
//! branch 0 for receive keys, branch 1 for change. The chain keeps a
//! lookahead window of derived-but-unissued keys so the network filter can
//! recognize payments to keys the user has not been shown yet, and
//! advances its issued watermark when a lookahead key is observed in a
//! transaction.

use std::collections::HashMap;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Network, PublicKey, ScriptBuf};

use super::{KeyCrypter, KeyHandle, KeySecret, ScriptType};
use crate::errors::{KeyError, Result};
use crate::types::DEFAULT_LOOKAHEAD;

/// Receive branch below the account node.
pub const EXTERNAL_BRANCH: u32 = 0;
/// Change branch below the account node.
pub const INTERNAL_BRANCH: u32 = 1;

/// How account paths are laid out under the master key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainStructure {
    /// Flat legacy layout: `m/0'` for P2PKH, `m/1'` for P2WPKH. The
    /// network does not affect the path.
    Bip32,
    /// Purpose-scoped layout: `m/44'/coin'/0'` for P2PKH,
    /// `m/84'/coin'/0'` for P2WPKH, with coin 0 on mainnet and 1
    /// elsewhere.
    Bip43,
}

enum ChainSecret {
    Plain(Xpriv),
    Encrypted(Vec<u8>),
}

struct DerivedEntry {
    branch: u32,
    index: u32,
    pubkey: CompressedPublicKey,
}

/// A deterministic chain of keys below one account node.
pub struct DeterministicChain {
    script_type: ScriptType,
    account_path: DerivationPath,
    account_xpub: Xpub,
    secret: ChainSecret,
    creation_time: u64,
    issued: [u32; 2],
    derived: [u32; 2],
    lookahead: u32,
    entries: Vec<DerivedEntry>,
    by_hash: HashMap<[u8; 20], usize>,
    secp: Secp256k1<All>,
}

impl DeterministicChain {
    /// The account path this structure, script type and network derive
    /// keys under.
    pub fn account_path_for(
        structure: ChainStructure,
        script_type: ScriptType,
        network: Network,
    ) -> DerivationPath {
        let hardened =
            |idx: u32| ChildNumber::from_hardened_idx(idx).expect("index below 2^31");
        match structure {
            ChainStructure::Bip32 => {
                let account = match script_type {
                    ScriptType::P2pkh => 0,
                    ScriptType::P2wpkh => 1,
                };
                DerivationPath::master().child(hardened(account))
            }
            ChainStructure::Bip43 => {
                let purpose = match script_type {
                    ScriptType::P2pkh => 44,
                    ScriptType::P2wpkh => 84,
                };
                let coin = if network == Network::Bitcoin { 0 } else { 1 };
                DerivationPath::master()
                    .child(hardened(purpose))
                    .child(hardened(coin))
                    .child(hardened(0))
            }
        }
    }

    /// Creates a chain from a BIP39-derived seed.
    pub fn from_seed(
        seed: &[u8],
        structure: ChainStructure,
        script_type: ScriptType,
        network: Network,
        creation_time: u64,
    ) -> Result<Self> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed).map_err(KeyError::Bip32)?;
        let account_path = Self::account_path_for(structure, script_type, network);
        let account_xpriv =
            master.derive_priv(&secp, &account_path).map_err(KeyError::Bip32)?;
        let account_xpub = Xpub::from_priv(&secp, &account_xpriv);
        let mut chain = Self {
            script_type,
            account_path,
            account_xpub,
            secret: ChainSecret::Plain(account_xpriv),
            creation_time,
            issued: [0, 0],
            derived: [0, 0],
            lookahead: DEFAULT_LOOKAHEAD,
            entries: Vec::new(),
            by_hash: HashMap::new(),
            secp,
        };
        chain.ensure_lookahead()?;
        Ok(chain)
    }

    /// The script family this chain issues keys for.
    pub fn script_type(&self) -> ScriptType { self.script_type }

    /// The full account path below the master key.
    pub fn account_path(&self) -> &DerivationPath { &self.account_path }

    /// When the chain was created, seconds since the Unix epoch.
    pub fn creation_time(&self) -> u64 { self.creation_time }

    /// Whether the chain predates the given rotation threshold.
    pub fn is_rotating(&self, rotation_time: u64) -> bool { self.creation_time < rotation_time }

    /// Whether private material exists (possibly encrypted).
    pub fn is_encrypted(&self) -> bool { matches!(self.secret, ChainSecret::Encrypted(_)) }

    fn derive_one(&mut self, branch: u32) -> Result<()> {
        let index = self.derived[branch as usize];
        let children = [
            ChildNumber::from_normal_idx(branch).map_err(KeyError::Bip32)?,
            ChildNumber::from_normal_idx(index).map_err(KeyError::Bip32)?,
        ];
        let xpub =
            self.account_xpub.derive_pub(&self.secp, &children).map_err(KeyError::Bip32)?;
        let pubkey = CompressedPublicKey(xpub.public_key);
        let hash = pubkey.pubkey_hash().to_byte_array();
        self.entries.push(DerivedEntry { branch, index, pubkey });
        self.by_hash.insert(hash, self.entries.len() - 1);
        self.derived[branch as usize] += 1;
        Ok(())
    }

    fn ensure_lookahead(&mut self) -> Result<()> {
        for branch in [EXTERNAL_BRANCH, INTERNAL_BRANCH] {
            while self.derived[branch as usize]
                < self.issued[branch as usize] + self.lookahead
            {
                self.derive_one(branch)?;
            }
        }
        Ok(())
    }

    fn handle_for(&self, entry: &DerivedEntry) -> KeyHandle {
        let path = self
            .account_path
            .child(ChildNumber::Normal { index: entry.branch })
            .child(ChildNumber::Normal { index: entry.index });
        let secret = match &self.secret {
            ChainSecret::Plain(account) => {
                let children = [
                    ChildNumber::Normal { index: entry.branch },
                    ChildNumber::Normal { index: entry.index },
                ];
                match account.derive_priv(&self.secp, &children) {
                    Ok(child) => KeySecret::Plain(child.private_key),
                    Err(_) => KeySecret::Missing,
                }
            }
            ChainSecret::Encrypted(ciphertext) => KeySecret::EncryptedAccount {
                ciphertext: ciphertext.clone(),
                rel_path: [entry.branch, entry.index],
            },
        };
        KeyHandle {
            pubkey: entry.pubkey,
            path: Some(path),
            creation_time: self.creation_time,
            secret,
        }
    }

    fn entry_at(&self, branch: u32, index: u32) -> Option<&DerivedEntry> {
        self.entries.iter().find(|e| e.branch == branch && e.index == index)
    }

    /// Issues a fresh key on `branch` and returns it.
    pub fn fresh_key(&mut self, branch: u32) -> Result<KeyHandle> {
        let index = self.issued[branch as usize];
        self.issued[branch as usize] += 1;
        self.ensure_lookahead()?;
        let entry = self
            .entry_at(branch, index)
            .ok_or_else(|| KeyError::MissingPrivateKey)?;
        Ok(self.handle_for(entry))
    }

    /// The most recently issued key on `branch`, issuing the first one on
    /// demand.
    pub fn current_key(&mut self, branch: u32) -> Result<KeyHandle> {
        if self.issued[branch as usize] == 0 {
            return self.fresh_key(branch);
        }
        let index = self.issued[branch as usize] - 1;
        let entry = self
            .entry_at(branch, index)
            .ok_or_else(|| KeyError::MissingPrivateKey)?;
        Ok(self.handle_for(entry))
    }

    /// The scriptPubKey paying the given key in this chain's script
    /// family.
    pub fn script_of(&self, handle: &KeyHandle) -> ScriptBuf {
        match self.script_type {
            ScriptType::P2pkh => ScriptBuf::new_p2pkh(&handle.pubkey.pubkey_hash()),
            ScriptType::P2wpkh => ScriptBuf::new_p2wpkh(&handle.pubkey.wpubkey_hash()),
        }
    }

    /// Finds a key by the hash160 of its public key.
    pub fn find_by_pubkey_hash(&self, hash: &[u8; 20]) -> Option<KeyHandle> {
        self.by_hash.get(hash).map(|&i| self.handle_for(&self.entries[i]))
    }

    /// Finds a key by its public key.
    pub fn find_by_pubkey(&self, pubkey: &PublicKey) -> Option<KeyHandle> {
        self.entries
            .iter()
            .find(|e| e.pubkey.0 == pubkey.inner)
            .map(|e| self.handle_for(e))
    }

    /// Marks the key with this pubkey hash as used, advancing the issued
    /// watermark past it so the next fresh key lands beyond anything the
    /// network has seen. Returns whether the hash belongs to this chain.
    pub fn mark_hash_used(&mut self, hash: &[u8; 20]) -> bool {
        let Some(&i) = self.by_hash.get(hash) else { return false };
        let (branch, index) = (self.entries[i].branch, self.entries[i].index);
        if index >= self.issued[branch as usize] {
            self.issued[branch as usize] = index + 1;
            // Lookahead derivation is public-only and cannot fail once the
            // chain exists.
            let _ = self.ensure_lookahead();
        }
        true
    }

    /// Encrypts the account private key in place.
    pub fn encrypt(&mut self, crypter: &dyn KeyCrypter, user_key: &[u8]) -> Result<()> {
        if let ChainSecret::Plain(account) = &self.secret {
            let ciphertext = crypter.encrypt(&account.encode(), user_key);
            self.secret = ChainSecret::Encrypted(ciphertext);
        }
        Ok(())
    }

    /// Decrypts the account private key in place.
    ///
    /// # Errors
    /// [`KeyError::BadEncryptionKey`] if decryption fails or the decrypted
    /// key does not match the account public key.
    pub fn decrypt(&mut self, crypter: &dyn KeyCrypter, user_key: &[u8]) -> Result<()> {
        if let ChainSecret::Encrypted(ciphertext) = &self.secret {
            let plaintext = crypter.decrypt(ciphertext, user_key)?;
            let account =
                Xpriv::decode(&plaintext).map_err(|_| KeyError::BadEncryptionKey)?;
            if Xpub::from_priv(&self.secp, &account) != self.account_xpub {
                return Err(KeyError::BadEncryptionKey.into());
            }
            self.secret = ChainSecret::Plain(account);
        }
        Ok(())
    }

    /// Checks that `user_key` decrypts this chain's material without
    /// changing its state.
    pub fn verify_user_key(&self, crypter: &dyn KeyCrypter, user_key: &[u8]) -> Result<()> {
        if let ChainSecret::Encrypted(ciphertext) = &self.secret {
            let plaintext = crypter.decrypt(ciphertext, user_key)?;
            let account =
                Xpriv::decode(&plaintext).map_err(|_| KeyError::BadEncryptionKey)?;
            if Xpub::from_priv(&self.secp, &account) != self.account_xpub {
                return Err(KeyError::BadEncryptionKey.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 64] = [42u8; 64];

    fn parse(path: &str) -> DerivationPath {
        path.parse().expect("valid derivation path")
    }

    #[test]
    fn test_bip43_account_paths() {
        assert_eq!(
            DeterministicChain::account_path_for(
                ChainStructure::Bip43,
                ScriptType::P2wpkh,
                Network::Bitcoin
            ),
            parse("m/84'/0'/0'")
        );
        assert_eq!(
            DeterministicChain::account_path_for(
                ChainStructure::Bip43,
                ScriptType::P2pkh,
                Network::Testnet
            ),
            parse("m/44'/1'/0'")
        );
    }

    #[test]
    fn test_bip32_account_paths_ignore_network() {
        for network in [Network::Bitcoin, Network::Testnet] {
            assert_eq!(
                DeterministicChain::account_path_for(
                    ChainStructure::Bip32,
                    ScriptType::P2wpkh,
                    network
                ),
                parse("m/1'")
            );
            assert_eq!(
                DeterministicChain::account_path_for(
                    ChainStructure::Bip32,
                    ScriptType::P2pkh,
                    network
                ),
                parse("m/0'")
            );
        }
    }

    #[test]
    fn test_fresh_keys_advance() {
        let mut chain = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2wpkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");

        let first = chain.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        let second = chain.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        assert_ne!(first.pubkey, second.pubkey);

        let current = chain.current_key(EXTERNAL_BRANCH).expect("current key");
        assert_eq!(current.pubkey, second.pubkey);
    }

    #[test]
    fn test_find_by_hash_within_lookahead() {
        let chain = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2wpkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");

        // No keys issued yet, but the lookahead window is searchable.
        let mut probe = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2wpkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");
        let key = probe.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        let hash = key.pubkey.pubkey_hash().to_byte_array();

        let found = chain.find_by_pubkey_hash(&hash).expect("lookahead key should be found");
        assert_eq!(found.pubkey, key.pubkey);
    }

    #[test]
    fn test_mark_used_advances_watermark() {
        let mut chain = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2wpkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");

        let mut probe = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2wpkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");
        probe.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        probe.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        let third = probe.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        let hash = third.pubkey.pubkey_hash().to_byte_array();

        assert!(chain.mark_hash_used(&hash));

        // The next fresh key must land beyond the observed index.
        let next = chain.fresh_key(EXTERNAL_BRANCH).expect("fresh key");
        assert_ne!(next.pubkey, third.pubkey);
    }

    #[test]
    fn test_signing_key_matches_pubkey() {
        let mut chain = DeterministicChain::from_seed(
            &SEED,
            ChainStructure::Bip43,
            ScriptType::P2pkh,
            Network::Regtest,
            1_000,
        )
        .expect("chain creation should succeed");

        let key = chain.fresh_key(INTERNAL_BRANCH).expect("fresh key");
        let secp = Secp256k1::new();
        let sk = key.secret_key().expect("plain secret should be present");
        assert_eq!(sk.public_key(&secp), key.pubkey.0);
    }
}
