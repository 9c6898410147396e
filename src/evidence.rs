//! Destination-chain delivery proof
//!
//! The verifier fetches the payout transaction (with bounded retries, since
//! metadata lags submission) and sums the recipient's balance change across
//! it. Token deltas are summed over every account the recipient owns for the
//! mint, so a token account created inside the transaction still counts.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::hash::evidence_hash;
use crate::retry::{with_retry, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalanceEntry {
    pub account_index: usize,
    pub owner: [u8; 32],
    pub mint: [u8; 32],
    pub amount: u128,
}

/// Pre/post balances as reported in Solana transaction metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub account_keys: Vec<[u8; 32]>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub pre_token_balances: Vec<TokenBalanceEntry>,
    pub post_token_balances: Vec<TokenBalanceEntry>,
}

/// A value movement observed in an EVM receipt; `asset` is `None` for the
/// native coin. Addresses are left-padded to 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTransfer {
    pub from: [u8; 32],
    pub to: [u8; 32],
    pub asset: Option<[u8; 32]>,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvidence {
    Balances(BalanceSnapshot),
    Transfers(Vec<ValueTransfer>),
}

fn sum_token(entries: &[TokenBalanceEntry], owner: &[u8; 32], mint: &[u8; 32]) -> i128 {
    entries
        .iter()
        .filter(|e| &e.owner == owner && &e.mint == mint)
        .map(|e| e.amount as i128)
        .sum()
}

/// Net change of `recipient`'s holding of `asset` across the transaction
pub fn recipient_delta(
    evidence: &DeliveryEvidence,
    recipient: &[u8; 32],
    asset: Option<&[u8; 32]>,
) -> i128 {
    match evidence {
        DeliveryEvidence::Balances(snapshot) => match asset {
            None => snapshot
                .account_keys
                .iter()
                .position(|k| k == recipient)
                .map(|i| {
                    let pre = snapshot.pre_balances.get(i).copied().unwrap_or(0) as i128;
                    let post = snapshot.post_balances.get(i).copied().unwrap_or(0) as i128;
                    post - pre
                })
                .unwrap_or(0),
            Some(mint) => {
                sum_token(&snapshot.post_token_balances, recipient, mint)
                    - sum_token(&snapshot.pre_token_balances, recipient, mint)
            }
        },
        DeliveryEvidence::Transfers(transfers) => transfers
            .iter()
            .filter(|t| t.asset.as_ref() == asset)
            .map(|t| {
                let credit = if &t.to == recipient { t.amount as i128 } else { 0 };
                let debit = if &t.from == recipient { t.amount as i128 } else { 0 };
                credit - debit
            })
            .sum(),
    }
}

#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn chain(&self) -> &'static str;

    /// `NotYetVisible` while the transaction metadata is unavailable
    async fn fetch_evidence(&self, tx: &str) -> Result<DeliveryEvidence, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDelivery {
    pub dest_tx: String,
    pub delta: i128,
    pub evidence_hash: [u8; 32],
}

pub struct EvidenceVerifier {
    source: Arc<dyn EvidenceSource>,
    retry: RetryConfig,
}

impl EvidenceVerifier {
    pub fn new(source: Arc<dyn EvidenceSource>, retries: u32, interval: Duration) -> Self {
        Self {
            source,
            retry: RetryConfig::fixed(retries, interval),
        }
    }

    /// Accept iff the recipient's summed delta is at least `expected`
    pub async fn verify_delivery(
        &self,
        tx: &str,
        recipient: &[u8; 32],
        expected: u128,
        asset: Option<&[u8; 32]>,
    ) -> Result<VerifiedDelivery, BridgeError> {
        let evidence = with_retry(&self.retry, |attempt| {
            if attempt > 0 {
                debug!(chain = self.source.chain(), tx_hash = tx, attempt, "Refetching delivery evidence");
            }
            self.source.fetch_evidence(tx)
        })
        .await?;

        let delta = recipient_delta(&evidence, recipient, asset);
        if delta < 0 || (delta as u128) < expected {
            warn!(
                chain = self.source.chain(),
                tx_hash = tx,
                delta = %delta,
                expected = %expected,
                "Delivery below expectation"
            );
            return Err(BridgeError::VerificationFailed { delta, expected });
        }

        info!(
            chain = self.source.chain(),
            tx_hash = tx,
            delta = %delta,
            expected = %expected,
            "Delivery verified"
        );
        Ok(VerifiedDelivery {
            dest_tx: tx.to_string(),
            delta,
            evidence_hash: evidence_hash(tx, recipient, expected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const RECIPIENT: [u8; 32] = [0x11; 32];
    const PAYER: [u8; 32] = [0x22; 32];
    const MINT: [u8; 32] = [0x33; 32];
    const OTHER_MINT: [u8; 32] = [0x44; 32];

    fn token(account_index: usize, owner: [u8; 32], mint: [u8; 32], amount: u128) -> TokenBalanceEntry {
        TokenBalanceEntry {
            account_index,
            owner,
            mint,
            amount,
        }
    }

    fn credited(amount: u128) -> DeliveryEvidence {
        DeliveryEvidence::Balances(BalanceSnapshot {
            account_keys: vec![PAYER, [0x55; 32], [0x66; 32]],
            pre_balances: vec![10_000, 0, 0],
            post_balances: vec![9_000, 2_039_280, 0],
            pre_token_balances: vec![token(2, PAYER, MINT, 1_000_000)],
            post_token_balances: vec![
                token(1, RECIPIENT, MINT, amount),
                token(2, PAYER, MINT, 1_000_000 - amount),
            ],
        })
    }

    #[test]
    fn test_token_delta_counts_new_account() {
        assert_eq!(recipient_delta(&credited(500), &RECIPIENT, Some(&MINT)), 500);
        assert_eq!(recipient_delta(&credited(500), &RECIPIENT, Some(&OTHER_MINT)), 0);
    }

    #[test]
    fn test_token_delta_sums_multiple_accounts() {
        let evidence = DeliveryEvidence::Balances(BalanceSnapshot {
            pre_token_balances: vec![token(1, RECIPIENT, MINT, 100), token(2, RECIPIENT, MINT, 50)],
            post_token_balances: vec![
                token(1, RECIPIENT, MINT, 300),
                token(2, RECIPIENT, MINT, 75),
                token(3, RECIPIENT, OTHER_MINT, 9_999),
            ],
            ..Default::default()
        });
        assert_eq!(recipient_delta(&evidence, &RECIPIENT, Some(&MINT)), 225);
    }

    #[test]
    fn test_native_delta_uses_recipient_index() {
        let evidence = DeliveryEvidence::Balances(BalanceSnapshot {
            account_keys: vec![PAYER, RECIPIENT],
            pre_balances: vec![5_000_000, 1_000],
            post_balances: vec![3_995_000, 1_001_000],
            ..Default::default()
        });
        assert_eq!(recipient_delta(&evidence, &RECIPIENT, None), 1_000_000);
        assert_eq!(recipient_delta(&evidence, &[0x99; 32], None), 0);
    }

    #[test]
    fn test_transfer_delta_filters_asset() {
        let evidence = DeliveryEvidence::Transfers(vec![
            ValueTransfer {
                from: PAYER,
                to: RECIPIENT,
                asset: Some(MINT),
                amount: 70,
            },
            ValueTransfer {
                from: PAYER,
                to: RECIPIENT,
                asset: None,
                amount: 5,
            },
            ValueTransfer {
                from: PAYER,
                to: RECIPIENT,
                asset: Some(MINT),
                amount: 30,
            },
        ]);
        assert_eq!(recipient_delta(&evidence, &RECIPIENT, Some(&MINT)), 100);
        assert_eq!(recipient_delta(&evidence, &RECIPIENT, None), 5);
    }

    struct LaggingSource {
        evidence: DeliveryEvidence,
        invisible_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EvidenceSource for LaggingSource {
        fn chain(&self) -> &'static str {
            "test"
        }

        async fn fetch_evidence(&self, tx: &str) -> Result<DeliveryEvidence, BridgeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.invisible_for {
                return Err(BridgeError::NotYetVisible(tx.to_string()));
            }
            Ok(self.evidence.clone())
        }
    }

    fn verifier(evidence: DeliveryEvidence, invisible_for: u32) -> EvidenceVerifier {
        EvidenceVerifier::new(
            Arc::new(LaggingSource {
                evidence,
                invisible_for,
                calls: AtomicU32::new(0),
            }),
            5,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_exact_credit_passes_and_short_credit_fails() {
        let ok = verifier(credited(1_000), 2)
            .verify_delivery("sig", &RECIPIENT, 1_000, Some(&MINT))
            .await
            .unwrap();
        assert_eq!(ok.delta, 1_000);
        assert_eq!(ok.evidence_hash, evidence_hash("sig", &RECIPIENT, 1_000));

        let err = verifier(credited(999), 0)
            .verify_delivery("sig", &RECIPIENT, 1_000, Some(&MINT))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::VerificationFailed {
                delta: 999,
                expected: 1_000
            }
        );
    }

    #[tokio::test]
    async fn test_over_delivery_accepted() {
        assert!(verifier(credited(1_500), 0)
            .verify_delivery("sig", &RECIPIENT, 1_000, Some(&MINT))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_evidence_retries_are_bounded() {
        let err = verifier(credited(1_000), 100)
            .verify_delivery("sig", &RECIPIENT, 1_000, Some(&MINT))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotYetVisible(_)));
    }
}
