//! Transaction broadcasting interface
//!
//! The network layer is a collaborator: the wallet hands it transactions
//! and watches completion through a pair of promises. Broadcast failures
//! stay isolated in the handle; the transaction remains PENDING and is
//! retried when the network layer reconnects.

use bitcoin::{Transaction, Txid};

use crate::confidence::Promise;

/// Tracks one transaction through send and relay.
#[derive(Clone)]
pub struct Broadcast {
    txid: Txid,
    sent: Promise<Result<Txid, String>>,
    relayed: Promise<Result<Txid, String>>,
}

impl Broadcast {
    /// Creates a handle for `txid`.
    pub fn new(txid: Txid) -> Self {
        Self { txid, sent: Promise::new(), relayed: Promise::new() }
    }

    /// The transaction being broadcast.
    pub fn txid(&self) -> Txid { self.txid }

    /// Completes when the transaction has been written to at least one
    /// peer. The wallet lock must not be held while waiting.
    pub fn await_sent(&self) -> &Promise<Result<Txid, String>> { &self.sent }

    /// Completes when enough peers have announced the transaction back
    /// that it can be considered propagating.
    pub fn await_relayed(&self) -> &Promise<Result<Txid, String>> { &self.relayed }

    /// Network layer callback: the transaction was sent.
    pub fn mark_sent(&self) { self.sent.complete(Ok(self.txid)); }

    /// Network layer callback: the transaction is relaying.
    pub fn mark_relayed(&self) {
        // Relay implies the send completed even if the network layer
        // skipped the intermediate notification.
        self.sent.complete(Ok(self.txid));
        self.relayed.complete(Ok(self.txid));
    }

    /// Network layer callback: the broadcast failed.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sent.complete(Err(reason.clone()));
        self.relayed.complete(Err(reason));
    }
}

/// Sends transactions to the network.
pub trait Broadcaster: Send + Sync {
    /// Starts broadcasting `tx` and returns its completion handle.
    fn broadcast(&self, tx: &Transaction) -> Broadcast;
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    #[test]
    fn test_relay_implies_sent() {
        let broadcast = Broadcast::new(Txid::from_byte_array([1; 32]));
        broadcast.mark_relayed();
        assert!(broadcast.await_sent().is_complete());
        assert!(broadcast.await_relayed().get().expect("complete").is_ok());
    }

    #[test]
    fn test_failure_completes_both() {
        let broadcast = Broadcast::new(Txid::from_byte_array([1; 32]));
        broadcast.mark_failed("no peers");
        assert!(broadcast.await_sent().get().expect("complete").is_err());
        assert!(broadcast.await_relayed().get().expect("complete").is_err());
    }

    #[test]
    fn test_first_completion_wins() {
        let broadcast = Broadcast::new(Txid::from_byte_array([1; 32]));
        broadcast.mark_sent();
        broadcast.mark_failed("late failure");
        assert!(broadcast.await_sent().get().expect("complete").is_ok());
    }
}
