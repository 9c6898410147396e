//! Destination-chain payout
//!
//! Converts the source amount through the `TokenMappingTable`, checks the
//! executor balance, submits a native or token transfer and waits for
//! confirmation. A recorded but unconfirmed payout is polled, then replaced a
//! bounded number of times; it is never blindly resent. Replaced transactions
//! stay watched, and whichever one confirms is the payout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::claims::SubmissionPolicy;
use crate::error::BridgeError;
use crate::retry::{watch_submission, WindowOutcome};
use crate::token_mapping::{PayoutAsset, TokenMappingTable};
use crate::types::{Direction, ResolvedDestination, TxStatus};

/// Destination-chain surface used to pay recipients
#[async_trait]
pub trait PayoutChain: Send + Sync {
    fn chain(&self) -> &'static str;

    /// Executor balance of the payout asset, in destination base units
    async fn balance(&self, asset: &PayoutAsset) -> Result<u128, BridgeError>;

    async fn submit_transfer(
        &self,
        to: &ResolvedDestination,
        asset: &PayoutAsset,
        amount: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError>;

    async fn transfer_status(&self, tx: &str) -> Result<TxStatus, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutPlan {
    pub asset: PayoutAsset,
    /// Destination base units
    pub amount: u128,
    /// Source units dropped by floor truncation
    pub dust: u128,
}

/// Payout state carried over from the persisted record
#[derive(Debug, Clone, Default)]
pub struct PayoutProgress {
    pub tx: Option<String>,
    pub attempts: u32,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Persists each submission before its confirmation is awaited
#[async_trait]
pub trait PayoutRecorder: Send + Sync {
    async fn payout_submitted(&self, tx: &str, attempts: u32) -> Result<(), BridgeError>;
}

pub struct TransferExecutor {
    chain: Arc<dyn PayoutChain>,
    mappings: Arc<TokenMappingTable>,
    policy: SubmissionPolicy,
}

impl TransferExecutor {
    pub fn new(
        chain: Arc<dyn PayoutChain>,
        mappings: Arc<TokenMappingTable>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            chain,
            mappings,
            policy,
        }
    }

    pub fn chain(&self) -> &'static str {
        self.chain.chain()
    }

    pub fn plan(
        &self,
        direction: Direction,
        source_token: &str,
        source_amount: u128,
    ) -> Result<PayoutPlan, BridgeError> {
        let (route, converted) = self.mappings.convert(direction, source_token, source_amount)?;
        if converted.amount == 0 {
            return Err(BridgeError::Validation(format!(
                "amount {} converts to zero destination units",
                source_amount
            )));
        }
        Ok(PayoutPlan {
            asset: route.asset,
            amount: converted.amount,
            dust: converted.dust,
        })
    }

    async fn ensure_balance(&self, plan: &PayoutPlan) -> Result<(), BridgeError> {
        let available = self.chain.balance(&plan.asset).await?;
        if available < plan.amount {
            return Err(BridgeError::InsufficientBalance {
                available,
                required: plan.amount,
            });
        }
        Ok(())
    }

    async fn submit(
        &self,
        destination: &ResolvedDestination,
        plan: &PayoutPlan,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        self.ensure_balance(plan).await?;
        self.chain
            .submit_transfer(destination, &plan.asset, plan.amount, replaces)
            .await
    }

    fn remaining_window(&self, submitted_at: Option<DateTime<Utc>>) -> Duration {
        let Some(at) = submitted_at else {
            return self.policy.receipt_window;
        };
        let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
        self.policy.receipt_window.saturating_sub(elapsed)
    }

    /// The first earlier submission that has since confirmed
    async fn confirmed_earlier(&self, earlier: &[String]) -> Option<String> {
        for tx in earlier {
            match self.chain.transfer_status(tx).await {
                Ok(TxStatus::Confirmed) => return Some(tx.clone()),
                Ok(_) => {}
                Err(e) => warn!(chain = self.chain(), tx_hash = %tx, error = %e, "Replaced payout poll failed"),
            }
        }
        None
    }

    /// Pay `plan.amount` to `destination` and return the confirmed tx
    pub async fn payout(
        &self,
        destination: &ResolvedDestination,
        plan: &PayoutPlan,
        progress: PayoutProgress,
        recorder: &dyn PayoutRecorder,
    ) -> Result<String, BridgeError> {
        let mut attempts = progress.attempts;
        let mut resumed = progress.tx.is_some();
        let mut earlier: Vec<String> = Vec::new();
        let (mut tx, mut window) = match progress.tx {
            Some(tx) => {
                info!(chain = self.chain(), tx_hash = %tx, attempts, "Resuming recorded payout");
                (tx, self.remaining_window(progress.submitted_at))
            }
            None => {
                let tx = self.submit(destination, plan, None).await?;
                attempts += 1;
                recorder.payout_submitted(&tx, attempts).await?;
                info!(
                    chain = self.chain(),
                    tx_hash = %tx,
                    amount = %plan.amount,
                    asset = ?plan.asset,
                    "Payout submitted"
                );
                (tx, self.policy.receipt_window)
            }
        };

        loop {
            let outcome = watch_submission(window, self.policy.poll_interval, || {
                self.chain.transfer_status(&tx)
            })
            .await?;
            window = self.policy.receipt_window;

            let replaces = match outcome {
                WindowOutcome::Confirmed => {
                    info!(chain = self.chain(), tx_hash = %tx, "Payout confirmed");
                    return Ok(tx);
                }
                // A reverted transaction moved nothing; a resumed one may be resent
                WindowOutcome::Failed(reason) if resumed => {
                    warn!(chain = self.chain(), tx_hash = %tx, %reason, "Recorded payout failed");
                    None
                }
                WindowOutcome::Failed(reason) => {
                    // A reverted replacement usually means the one it replaced landed
                    if let Some(landed) = self.confirmed_earlier(&earlier).await {
                        info!(chain = self.chain(), tx_hash = %landed, "Replaced payout confirmed");
                        return Ok(landed);
                    }
                    return Err(BridgeError::SubmissionFailed(format!(
                        "payout {} failed: {}",
                        tx, reason
                    )));
                }
                WindowOutcome::Elapsed => {
                    if let Some(landed) = self.confirmed_earlier(&earlier).await {
                        info!(chain = self.chain(), tx_hash = %landed, "Replaced payout confirmed");
                        return Ok(landed);
                    }
                    Some(tx.clone())
                }
            };

            if attempts > self.policy.max_replacements {
                return Err(BridgeError::SubmissionFailed(format!(
                    "payout {} unconfirmed after {} attempts",
                    tx, attempts
                )));
            }
            let next = self.submit(destination, plan, replaces.as_deref()).await?;
            attempts += 1;
            recorder.payout_submitted(&next, attempts).await?;
            warn!(
                chain = self.chain(),
                replaced = %tx,
                tx_hash = %next,
                attempt = attempts,
                "Payout resubmitted"
            );
            if replaces.is_some() {
                earlier.push(tx);
            }
            tx = next;
            resumed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_mapping::TokenMapping;
    use std::sync::Mutex;

    struct FakeChain {
        balance: u128,
        /// Number of polls per tx before it confirms; `None` never confirms
        confirm_after: Option<u32>,
        fail_first: bool,
        /// Confirms only after it has been replaced
        lands_late: Option<String>,
        submissions: Mutex<Vec<(u128, Option<String>)>>,
        polls: Mutex<u32>,
    }

    impl FakeChain {
        fn new(balance: u128, confirm_after: Option<u32>) -> Self {
            Self {
                balance,
                confirm_after,
                fail_first: false,
                lands_late: None,
                submissions: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PayoutChain for FakeChain {
        fn chain(&self) -> &'static str {
            "fake"
        }

        async fn balance(&self, _asset: &PayoutAsset) -> Result<u128, BridgeError> {
            Ok(self.balance)
        }

        async fn submit_transfer(
            &self,
            _to: &ResolvedDestination,
            _asset: &PayoutAsset,
            amount: u128,
            replaces: Option<&str>,
        ) -> Result<String, BridgeError> {
            let mut subs = self.submissions.lock().unwrap();
            subs.push((amount, replaces.map(str::to_string)));
            Ok(format!("payout-{}", subs.len()))
        }

        async fn transfer_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
            if self.fail_first && tx == "recorded" {
                return Ok(TxStatus::Failed("reverted".into()));
            }
            if self.lands_late.as_deref() == Some(tx) {
                if self.submissions.lock().unwrap().len() > 1 {
                    return Ok(TxStatus::Confirmed);
                }
                return Ok(TxStatus::Pending);
            }
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            match self.confirm_after {
                Some(n) if *polls >= n => Ok(TxStatus::Confirmed),
                _ => Ok(TxStatus::Pending),
            }
        }
    }

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(String, u32)>>);

    #[async_trait]
    impl PayoutRecorder for Recorded {
        async fn payout_submitted(&self, tx: &str, attempts: u32) -> Result<(), BridgeError> {
            self.0.lock().unwrap().push((tx.to_string(), attempts));
            Ok(())
        }
    }

    fn mappings() -> Arc<TokenMappingTable> {
        Arc::new(
            TokenMappingTable::new(vec![TokenMapping {
                direction: Direction::SolToEvm,
                source_address: "UsdcMint1111111111111111111111111111111111".into(),
                destination_address: "0x00000000000000000000000000000000000000aa".into(),
                source_decimals: 6,
                destination_decimals: 18,
            }])
            .unwrap(),
        )
    }

    fn policy() -> SubmissionPolicy {
        SubmissionPolicy {
            receipt_window: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            max_replacements: 2,
        }
    }

    #[test]
    fn test_plan_scales_mapped_token() {
        let executor = TransferExecutor::new(Arc::new(FakeChain::new(0, None)), mappings(), policy());
        let plan = executor
            .plan(
                Direction::SolToEvm,
                "UsdcMint1111111111111111111111111111111111",
                100,
            )
            .unwrap();
        assert_eq!(plan.amount, 100 * 10u128.pow(12));
        assert!(matches!(plan.asset, PayoutAsset::Token { decimals: 18, .. }));
    }

    #[test]
    fn test_plan_unmapped_is_native() {
        let executor = TransferExecutor::new(Arc::new(FakeChain::new(0, None)), mappings(), policy());
        let plan = executor
            .plan(Direction::EvmToSol, "0x0000000000000000000000000000000000000000", 1_500_000_001)
            .unwrap();
        assert_eq!(plan.asset, PayoutAsset::Native);
        assert_eq!(plan.amount, 1);
        assert_eq!(plan.dust, 500_000_001);
        assert!(matches!(
            executor.plan(Direction::EvmToSol, "0x00", 999_999_999),
            Err(BridgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_reported_before_submission() {
        let chain = Arc::new(FakeChain::new(10, Some(1)));
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 11,
            dust: 0,
        };
        let err = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, PayoutProgress::default(), &Recorded::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::InsufficientBalance {
                available: 10,
                required: 11
            }
        );
        assert!(err.keeps_status());
        assert!(chain.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payout_records_before_confirming() {
        let chain = Arc::new(FakeChain::new(1_000, Some(2)));
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 500,
            dust: 0,
        };
        let recorder = Recorded::default();
        let tx = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, PayoutProgress::default(), &recorder)
            .await
            .unwrap();
        assert_eq!(tx, "payout-1");
        assert_eq!(*recorder.0.lock().unwrap(), vec![("payout-1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_recorded_payout_is_polled_not_resent() {
        let chain = Arc::new(FakeChain::new(1_000, Some(1)));
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 500,
            dust: 0,
        };
        let progress = PayoutProgress {
            tx: Some("recorded".into()),
            attempts: 1,
            submitted_at: Some(Utc::now()),
        };
        let tx = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, progress, &Recorded::default())
            .await
            .unwrap();
        assert_eq!(tx, "recorded");
        assert!(chain.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_payout_replacements_are_bounded() {
        let chain = Arc::new(FakeChain::new(1_000, None));
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 500,
            dust: 0,
        };
        let err = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, PayoutProgress::default(), &Recorded::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SubmissionFailed(_)));
        let subs = chain.submissions.lock().unwrap();
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[1].1.as_deref(), Some("payout-1"));
        assert_eq!(subs[2].1.as_deref(), Some("payout-2"));
    }

    #[tokio::test]
    async fn test_failed_recorded_payout_is_resent_once() {
        let mut chain = FakeChain::new(1_000, Some(1));
        chain.fail_first = true;
        let chain = Arc::new(chain);
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 500,
            dust: 0,
        };
        let progress = PayoutProgress {
            tx: Some("recorded".into()),
            attempts: 1,
            submitted_at: Some(Utc::now()),
        };
        let tx = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, progress, &Recorded::default())
            .await
            .unwrap();
        assert_eq!(tx, "payout-1");
        assert_eq!(chain.submissions.lock().unwrap()[0].1, None);
    }

    #[tokio::test]
    async fn test_replaced_payout_that_lands_late_is_accepted() {
        let mut chain = FakeChain::new(1_000, None);
        chain.lands_late = Some("payout-1".into());
        let chain = Arc::new(chain);
        let executor = TransferExecutor::new(chain.clone(), mappings(), policy());
        let plan = PayoutPlan {
            asset: PayoutAsset::Native,
            amount: 500,
            dust: 0,
        };
        let tx = executor
            .payout(&ResolvedDestination([1u8; 32]), &plan, PayoutProgress::default(), &Recorded::default())
            .await
            .unwrap();
        assert_eq!(tx, "payout-1");
        assert_eq!(chain.submissions.lock().unwrap().len(), 2);
    }
}
