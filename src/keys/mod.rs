//! Key registry: signing material lookup and bookkeeping
//!
//! The registry is split along capability lines. The [`KeyBag`] trait is
//! the read-only lookup surface the signer chain consumes, so signers can
//! be tested against a stub; the concrete [`KeyChainGroup`] adds the
//! mutating bookkeeping (used-key watermarks, encryption, chain
//! synthesis) that only the wallet drives.
//!
//! # Structure
//!
//! - `chain`: a single BIP32 deterministic chain with issued/lookahead
//!   bookkeeping
//! - `group`: the collection of chains a wallet holds, plus the P2SH
//!   redeem registry and encryption state

pub mod chain;
pub mod group;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{PublicKey, ScriptBuf};

pub use chain::{ChainStructure, DeterministicChain};
pub use group::KeyChainGroup;

use crate::errors::{KeyError, Result};

/// Output script families a key can control directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptType {
    /// Legacy pay-to-pubkey-hash (and bare pay-to-pubkey).
    P2pkh,
    /// Native segwit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
}

/// Signing material attached to a [`KeyHandle`].
#[derive(Clone, Debug)]
pub enum KeySecret {
    /// No private material; the wallet is watching only.
    Missing,
    /// The private key, in the clear.
    Plain(SecretKey),
    /// The account private key is encrypted at rest; `rel_path` locates
    /// this key below the account once decrypted.
    EncryptedAccount {
        /// Ciphertext of the serialized account extended private key.
        ciphertext: Vec<u8>,
        /// Unhardened (branch, index) below the account.
        rel_path: [u32; 2],
    },
}

/// A key the registry knows about, with enough context to sign.
#[derive(Clone, Debug)]
pub struct KeyHandle {
    /// The public key.
    pub pubkey: CompressedPublicKey,
    /// Full derivation path from the master, when deterministic.
    pub path: Option<DerivationPath>,
    /// When the key was created, seconds since the Unix epoch.
    pub creation_time: u64,
    /// The private half, in whatever state it is stored.
    pub secret: KeySecret,
}

impl KeyHandle {
    /// The plain private key.
    ///
    /// # Errors
    /// [`KeyError::MissingPrivateKey`] if the material is absent or still
    /// encrypted (decrypt with [`KeyHandle::decrypt`] first).
    pub fn secret_key(&self) -> Result<SecretKey> {
        match &self.secret {
            KeySecret::Plain(sk) => Ok(*sk),
            KeySecret::Missing | KeySecret::EncryptedAccount { .. } =>
                Err(KeyError::MissingPrivateKey.into()),
        }
    }

    /// Whether the private half is present (possibly encrypted).
    pub fn has_secret(&self) -> bool { !matches!(self.secret, KeySecret::Missing) }

    /// Decrypts encrypted account material into a plain handle.
    ///
    /// The derived public key must match the handle's; a mismatch means the
    /// supplied key decrypted to garbage.
    ///
    /// # Errors
    /// [`KeyError::BadEncryptionKey`] on decryption failure or key
    /// mismatch.
    pub fn decrypt(&self, crypter: &dyn KeyCrypter, user_key: &[u8]) -> Result<KeyHandle> {
        let (ciphertext, rel_path) = match &self.secret {
            KeySecret::EncryptedAccount { ciphertext, rel_path } => (ciphertext, *rel_path),
            _ => return Ok(self.clone()),
        };
        let plaintext = crypter.decrypt(ciphertext, user_key)?;
        let account =
            Xpriv::decode(&plaintext).map_err(|_| KeyError::BadEncryptionKey)?;
        let secp = Secp256k1::new();
        let children = [
            ChildNumber::from_normal_idx(rel_path[0]).map_err(KeyError::Bip32)?,
            ChildNumber::from_normal_idx(rel_path[1]).map_err(KeyError::Bip32)?,
        ];
        let child = account.derive_priv(&secp, &children).map_err(KeyError::Bip32)?;
        let derived_pubkey = CompressedPublicKey(child.private_key.public_key(&secp));
        if derived_pubkey != self.pubkey {
            return Err(KeyError::BadEncryptionKey.into());
        }
        Ok(KeyHandle {
            pubkey: self.pubkey,
            path: self.path.clone(),
            creation_time: self.creation_time,
            secret: KeySecret::Plain(child.private_key),
        })
    }
}

/// Everything needed to redeem a P2SH output.
#[derive(Clone, Debug)]
pub struct RedeemData {
    /// The redeem script hashing to the output's script hash.
    pub redeem_script: ScriptBuf,
    /// Keys participating in the redeem script; at most one usually has
    /// private material locally.
    pub keys: Vec<KeyHandle>,
}

impl RedeemData {
    /// The first key with accessible private material, if any.
    pub fn full_key(&self) -> Option<&KeyHandle> {
        self.keys.iter().find(|k| matches!(k.secret, KeySecret::Plain(_)))
    }
}

/// Read-only key lookup: the capability the signer chain consumes.
pub trait KeyBag: Send + Sync {
    /// Finds a key by its public key.
    fn find_key_by_pubkey(&self, pubkey: &PublicKey) -> Option<KeyHandle>;

    /// Finds a key by the hash of its public key, for outputs of the given
    /// script family.
    fn find_key_by_pubkey_hash(&self, hash: &[u8; 20], script_type: ScriptType)
        -> Option<KeyHandle>;

    /// Finds the redeem data for a P2SH script hash.
    fn find_redeem_data(&self, script_hash: &[u8; 20]) -> Option<RedeemData>;

    /// Whether the given public key belongs to this bag.
    fn is_pubkey_mine(&self, pubkey: &PublicKey) -> bool {
        self.find_key_by_pubkey(pubkey).is_some()
    }

    /// Whether the given P2SH script hash belongs to this bag.
    fn is_script_hash_mine(&self, script_hash: &[u8; 20]) -> bool {
        self.find_redeem_data(script_hash).is_some()
    }

    /// Creation time of the oldest key in the bag, seconds since the Unix
    /// epoch. `None` for an empty bag.
    fn earliest_key_creation_time(&self) -> Option<u64>;
}

/// Symmetric cipher for key material at rest.
///
/// The concrete cipher is a collaborator; the wallet only routes
/// ciphertext through it and maps failures to
/// [`KeyError::BadEncryptionKey`].
pub trait KeyCrypter: Send + Sync {
    /// Encrypts `plaintext` under the user key.
    fn encrypt(&self, plaintext: &[u8], user_key: &[u8]) -> Vec<u8>;

    /// Decrypts `ciphertext` under the user key.
    ///
    /// # Errors
    /// [`KeyError::BadEncryptionKey`] when the key is wrong or the
    /// ciphertext fails authentication.
    fn decrypt(&self, ciphertext: &[u8], user_key: &[u8]) -> Result<Vec<u8>>;
}

/// A key bag view that transparently decrypts encrypted material.
///
/// Wraps another bag together with the crypter and the user key for the
/// duration of a signing operation.
pub struct DecryptingKeyBag<'a> {
    inner: &'a dyn KeyBag,
    crypter: Option<&'a dyn KeyCrypter>,
    user_key: Option<&'a [u8]>,
}

impl<'a> DecryptingKeyBag<'a> {
    /// Wraps `inner`; `crypter` and `user_key` may be absent for
    /// unencrypted wallets.
    pub fn new(
        inner: &'a dyn KeyBag,
        crypter: Option<&'a dyn KeyCrypter>,
        user_key: Option<&'a [u8]>,
    ) -> Self {
        Self { inner, crypter, user_key }
    }

    fn maybe_decrypt(&self, handle: KeyHandle) -> KeyHandle {
        match (&handle.secret, self.crypter, self.user_key) {
            (KeySecret::EncryptedAccount { .. }, Some(crypter), Some(user_key)) =>
                handle.decrypt(crypter, user_key).unwrap_or(handle),
            _ => handle,
        }
    }
}

impl KeyBag for DecryptingKeyBag<'_> {
    fn find_key_by_pubkey(&self, pubkey: &PublicKey) -> Option<KeyHandle> {
        self.inner.find_key_by_pubkey(pubkey).map(|h| self.maybe_decrypt(h))
    }

    fn find_key_by_pubkey_hash(
        &self,
        hash: &[u8; 20],
        script_type: ScriptType,
    ) -> Option<KeyHandle> {
        self.inner.find_key_by_pubkey_hash(hash, script_type).map(|h| self.maybe_decrypt(h))
    }

    fn find_redeem_data(&self, script_hash: &[u8; 20]) -> Option<RedeemData> {
        self.inner.find_redeem_data(script_hash).map(|mut data| {
            data.keys = data.keys.into_iter().map(|h| self.maybe_decrypt(h)).collect();
            data
        })
    }

    fn earliest_key_creation_time(&self) -> Option<u64> {
        self.inner.earliest_key_creation_time()
    }
}
