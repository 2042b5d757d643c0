//! Error types for the satchel wallet library
//!
//! This module defines all error types used throughout the library,
//! providing detailed error information for debugging and handling.

use bitcoin::{Amount, Txid};
use thiserror::Error;

/// The main error type for the satchel wallet library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Payment completion errors
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Key registry errors
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A transaction was committed twice
    #[error("Transaction {0} is already in the pending pool")]
    AlreadyPending(Txid),

    /// An internal wallet invariant was violated
    #[error("Wallet consistency violation: {0}")]
    Consistency(String),
}

/// Errors that can occur while completing a payment request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// The selectable outputs do not cover the requested value plus fee
    #[error("Insufficient funds: missing {missing}, have {available} of {target} (fee {fee})")]
    InsufficientFunds {
        /// Additional value needed to complete the request
        missing: Amount,
        /// Total value the selector could gather
        available: Amount,
        /// Value the request asked to send
        target: Amount,
        /// Fee at the iteration that failed
        fee: Amount,
    },

    /// A requested output is below its dust threshold
    #[error("Transaction would contain a dust output")]
    Dusty,

    /// An output could not absorb the fee without becoming dust
    #[error("Cannot adjust output downwards: {value} is below the dust minimum {min_non_dust}")]
    CouldNotAdjustDownwards {
        /// Value the output would be left with
        value: Amount,
        /// Smallest non-dust value for that output
        min_non_dust: Amount,
    },

    /// The completed transaction exceeds the standard size limit
    #[error("Transaction of {size} bytes exceeds the maximum standard size")]
    ExceededMaxTxSize {
        /// Serialized size of the offending transaction
        size: usize,
    },

    /// More than one data carrier output was requested
    #[error("At most one OP_RETURN output is allowed per transaction")]
    MultipleOpReturn,
}

/// Errors that can occur in the key registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyError {
    /// The supplied decryption key does not unlock the key material
    #[error("Wrong decryption key for encrypted wallet")]
    BadEncryptionKey,

    /// Key rotation needs the decryption key to sign with the old keys
    #[error("Key rotation on an encrypted wallet requires the decryption key")]
    KeyRotationRequiresPassword,

    /// Synthesizing a fresh deterministic chain needs the decryption key
    #[error("Creating a replacement key chain on an encrypted wallet requires the decryption key")]
    DeterministicUpgradeRequiresPassword,

    /// Signing material for a key we can identify is not present
    #[error("Missing private key")]
    MissingPrivateKey,

    /// Derivation failed inside the BIP32 tree
    #[error("bip32 error")]
    Bip32(#[from] bitcoin::bip32::Error),

    /// The mnemonic phrase could not be parsed
    #[error("invalid mnemonic phrase")]
    Mnemonic,
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_into_error() {
        let err: Error = BuildError::Dusty.into();
        assert!(matches!(err, Error::Build(BuildError::Dusty)));
    }

    #[test]
    fn test_insufficient_funds_display() {
        let err = BuildError::InsufficientFunds {
            missing: Amount::from_sat(100),
            available: Amount::from_sat(900),
            target: Amount::from_sat(950),
            fee: Amount::from_sat(50),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("missing"));
    }

    #[test]
    fn test_key_error_into_error() {
        let err: Error = KeyError::MissingPrivateKey.into();
        assert!(matches!(err, Error::Key(KeyError::MissingPrivateKey)));
    }
}
