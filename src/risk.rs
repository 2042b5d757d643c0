//! Risk analysis of pending transactions
//!
//! Unconfirmed transactions cannot be verified, only judged. The analyzer
//! decides whether a pending transaction is safe enough to track; rejected
//! transactions are diverted to the risk-dropped ring rather than entering
//! the pools. The analyzer is pluggable so applications can substitute
//! their own policy.

use std::fmt;

use bitcoin::absolute::LockTime;
use bitcoin::Transaction;

use crate::types::{is_dust, MAX_STANDARD_TX_SIZE};

/// The wallet's current view of the chain, for finality decisions.
#[derive(Clone, Copy, Debug, Default)]
pub struct RiskContext {
    /// Height of the last best-chain block seen, if any.
    pub height: Option<u32>,
    /// Current wall-clock time, seconds since the Unix epoch.
    pub time: u64,
}

/// Why a transaction was judged risky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskReason {
    /// The transaction (or a dependency) is time-locked and not yet final;
    /// it could be replaced before it confirms.
    NonFinal,
    /// Non-standard version number; most nodes will not relay it.
    NonStandardVersion(i32),
    /// Contains a dust output; most nodes will not relay it.
    DustOutput,
    /// Larger than the standard size limit; most nodes will not relay it.
    Oversize,
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskReason::NonFinal => write!(f, "non-final"),
            RiskReason::NonStandardVersion(v) => write!(f, "non-standard version {v}"),
            RiskReason::DustOutput => write!(f, "dust output"),
            RiskReason::Oversize => write!(f, "exceeds standard size"),
        }
    }
}

/// The analyzer's verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskOutcome {
    /// Safe to track.
    Ok,
    /// Reject (unless the wallet accepts risky transactions).
    Risky(RiskReason),
}

impl RiskOutcome {
    /// Whether the verdict is [`RiskOutcome::Ok`].
    pub fn is_ok(&self) -> bool { matches!(self, RiskOutcome::Ok) }
}

/// Judges whether a pending transaction is safe to track.
pub trait RiskAnalyzer: Send + Sync {
    /// Analyzes `tx` with its known unconfirmed dependencies.
    fn analyze(
        &self,
        tx: &Transaction,
        dependencies: &[Transaction],
        context: &RiskContext,
    ) -> RiskOutcome;
}

/// The default policy: finality plus basic standardness.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRiskAnalyzer;

impl DefaultRiskAnalyzer {
    fn is_final(tx: &Transaction, context: &RiskContext) -> bool {
        if tx.lock_time == LockTime::ZERO || !tx.is_lock_time_enabled() {
            return true;
        }
        match tx.lock_time {
            LockTime::Blocks(height) => match context.height {
                // Final if it could be included in the next block.
                Some(tip) => height.to_consensus_u32() <= tip,
                None => false,
            },
            LockTime::Seconds(time) => u64::from(time.to_consensus_u32()) <= context.time,
        }
    }

    fn standardness(tx: &Transaction) -> Option<RiskReason> {
        let version = tx.version.0;
        if version < 1 || version > 2 {
            return Some(RiskReason::NonStandardVersion(version));
        }
        if tx.total_size() > MAX_STANDARD_TX_SIZE {
            return Some(RiskReason::Oversize);
        }
        if tx.output.iter().any(|o| is_dust(o.value, &o.script_pubkey)) {
            return Some(RiskReason::DustOutput);
        }
        None
    }
}

impl RiskAnalyzer for DefaultRiskAnalyzer {
    fn analyze(
        &self,
        tx: &Transaction,
        dependencies: &[Transaction],
        context: &RiskContext,
    ) -> RiskOutcome {
        if !Self::is_final(tx, context) {
            return RiskOutcome::Risky(RiskReason::NonFinal);
        }
        for dep in dependencies {
            if !Self::is_final(dep, context) {
                return RiskOutcome::Risky(RiskReason::NonFinal);
            }
        }
        if let Some(reason) = Self::standardness(tx) {
            return RiskOutcome::Risky(reason);
        }
        RiskOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::key::CompressedPublicKey;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    use super::*;

    fn spk() -> ScriptBuf {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).expect("valid secret key");
        let pk = CompressedPublicKey(sk.public_key(&secp));
        ScriptBuf::new_p2wpkh(&pk.wpubkey_hash())
    }

    fn tx(lock_time: u32, sequence: Sequence, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(lock_time),
            input: vec![TxIn {
                previous_output: OutPoint { txid: Txid::from_byte_array([1; 32]), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: spk() }],
        }
    }

    #[test]
    fn test_final_transaction_is_ok() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        let outcome = analyzer.analyze(&tx(0, Sequence::MAX, 50_000), &[], &context);
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_time_locked_transaction_is_risky() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        let locked = tx(200, Sequence::ZERO, 50_000);
        assert_eq!(
            analyzer.analyze(&locked, &[], &context),
            RiskOutcome::Risky(RiskReason::NonFinal)
        );
    }

    #[test]
    fn test_reached_locktime_is_final() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(200), time: 1_000 };
        let locked = tx(200, Sequence::ZERO, 50_000);
        assert!(analyzer.analyze(&locked, &[], &context).is_ok());
    }

    #[test]
    fn test_max_sequence_disables_locktime() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        let locked = tx(200, Sequence::MAX, 50_000);
        assert!(analyzer.analyze(&locked, &[], &context).is_ok());
    }

    #[test]
    fn test_non_final_dependency_is_risky() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        let dep = tx(500, Sequence::ZERO, 40_000);
        assert_eq!(
            analyzer.analyze(&tx(0, Sequence::MAX, 50_000), &[dep], &context),
            RiskOutcome::Risky(RiskReason::NonFinal)
        );
    }

    #[test]
    fn test_dust_output_is_risky() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        assert_eq!(
            analyzer.analyze(&tx(0, Sequence::MAX, 10), &[], &context),
            RiskOutcome::Risky(RiskReason::DustOutput)
        );
    }

    #[test]
    fn test_weird_version_is_risky() {
        let analyzer = DefaultRiskAnalyzer;
        let context = RiskContext { height: Some(100), time: 1_000 };
        let mut weird = tx(0, Sequence::MAX, 50_000);
        weird.version = Version(7);
        assert_eq!(
            analyzer.analyze(&weird, &[], &context),
            RiskOutcome::Risky(RiskReason::NonStandardVersion(7))
        );
    }
}
