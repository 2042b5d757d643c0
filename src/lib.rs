#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Satchel
//!
//! A Rust library implementing the core of a Bitcoin SPV wallet:
//! classification and storage of transactions relevant to a key set,
//! spent/unspent state maintenance through pending broadcast, block
//! confirmation, double-spend discovery and chain reorganization, and
//! assembly, signing and tracking of new payments.
//!
//! Script execution, peer-to-peer transport, the block header store and
//! the on-disk serialization format are collaborators reached through
//! small capability traits ([`signer::ScriptVerifier`],
//! [`broadcast::Broadcaster`], [`autosave::WalletPersister`]); elliptic
//! curve and BIP32 primitives come from the `bitcoin` crate.

pub mod autosave;
pub mod broadcast;
pub mod coinselect;
pub mod confidence;
pub mod errors;
pub mod events;
pub mod graph;
pub mod keys;
pub mod pool;
pub mod risk;
pub mod signer;
pub mod types;
pub mod wallet;

// Re-export commonly used types and functions
pub use confidence::{Confidence, ConfidenceKind, ConfidenceTable, Promise, Source};
pub use errors::{BuildError, Error, KeyError, Result};
pub use events::WalletEvent;
pub use keys::{ChainStructure, KeyChainGroup, ScriptType};
pub use types::{BalanceType, BlockId, ChainEventType, Pool};
pub use wallet::send::SendRequest;
pub use wallet::Wallet;
