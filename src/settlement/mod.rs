//! Source-chain finalization
//!
//! `SettlementSubmitter` checks the source-chain request and claim before
//! submitting `verifyAndSettle` (or its Solana counterpart) with the evidence
//! hash. The submitted transaction is recorded before its confirmation is
//! awaited, and a request the source chain already finalized under our claim
//! counts as settled. `MessageSink` delivers attested canonical messages.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::claims::SubmissionPolicy;
use crate::error::BridgeError;
use crate::evidence::VerifiedDelivery;
use crate::hash::bytes32_to_hex;
use crate::message::CanonicalMessage;
use crate::retry::{watch_submission, WindowOutcome};
use crate::token_mapping::PayoutAsset;
use crate::types::{unix_now, BridgeRequest, Claim, TxStatus};

pub mod attestation;

pub use attestation::{
    Attestation, AttestationProvider, FallbackAttestor, LocalKeyAttestor, NetworkAttestor,
};

/// Recorded in place of a settlement tx when the source chain was found
/// already finalized under our claim
pub const FINALIZED_MARKER: &str = "finalized";

/// Source-chain view of a request at settlement time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceState {
    pub finalized: bool,
    pub claim: Option<Claim>,
}

#[async_trait]
pub trait SettlementChain: Send + Sync {
    fn chain(&self) -> &'static str;

    fn solver_identity(&self) -> [u8; 32];

    /// `None` when the request does not exist on the source chain
    async fn source_state(&self, request: &BridgeRequest) -> Result<Option<SourceState>, BridgeError>;

    /// Send the finalizing instruction without waiting for it
    async fn send_settlement(
        &self,
        request: &BridgeRequest,
        dest_tx: &str,
        evidence_hash: &[u8; 32],
        evidence_url: &str,
    ) -> Result<String, BridgeError>;

    async fn settlement_status(&self, tx: &str) -> Result<TxStatus, BridgeError>;
}

/// Persists a sent settlement before its confirmation is awaited
#[async_trait]
pub trait SettlementRecorder: Send + Sync {
    async fn settlement_submitted(&self, tx: &str) -> Result<(), BridgeError>;
}

/// Request exists, is not finalized, and holds `solver`'s unexpired claim
pub fn check_guards(
    request: &BridgeRequest,
    state: Option<SourceState>,
    solver: &[u8; 32],
) -> Result<Claim, BridgeError> {
    let id = request.request_id.to_string();
    let state = state.ok_or_else(|| BridgeError::RequestNotFound(id.clone()))?;
    if state.finalized {
        return Err(BridgeError::AlreadyFinalized(id));
    }
    let claim = match state.claim {
        Some(claim) if claim.solver != [0u8; 32] => claim,
        _ => {
            return Err(BridgeError::NotClaimant {
                request_id: id,
                holder: bytes32_to_hex(&[0u8; 32]),
            })
        }
    };
    if unix_now() >= claim.deadline {
        return Err(BridgeError::ClaimExpired {
            deadline: claim.deadline,
        });
    }
    if claim.solver != *solver {
        return Err(BridgeError::NotClaimant {
            request_id: id,
            holder: bytes32_to_hex(&claim.solver),
        });
    }
    Ok(claim)
}

pub struct SettlementSubmitter {
    chain: Arc<dyn SettlementChain>,
    evidence_url_base: String,
    policy: SubmissionPolicy,
}

impl SettlementSubmitter {
    pub fn new(chain: Arc<dyn SettlementChain>, evidence_url_base: impl Into<String>) -> Self {
        Self {
            chain,
            evidence_url_base: evidence_url_base.into(),
            policy: SubmissionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SubmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Explorer link recorded alongside the evidence hash; empty when unset
    pub fn evidence_url(&self, dest_tx: &str) -> String {
        if self.evidence_url_base.is_empty() {
            return String::new();
        }
        format!("{}/{}", self.evidence_url_base.trim_end_matches('/'), dest_tx)
    }

    /// A finalized request is ours when our claim is still on it, or when it
    /// carries no claim and we have a settlement in flight
    fn finalized_by_us(&self, state: &SourceState, pending: Option<&str>) -> bool {
        match state.claim {
            Some(claim) => claim.solver == self.chain.solver_identity(),
            None => pending.is_some(),
        }
    }

    async fn watch(&self, tx: &str) -> Result<WindowOutcome, BridgeError> {
        watch_submission(self.policy.receipt_window, self.policy.poll_interval, || {
            self.chain.settlement_status(tx)
        })
        .await
    }

    /// `Some` when the source chain already finalized the request: success
    /// if it was finalized under our claim, `AlreadyFinalized` otherwise
    fn finalized_outcome(
        &self,
        request: &BridgeRequest,
        state: Option<SourceState>,
        pending: Option<&str>,
    ) -> Option<Result<String, BridgeError>> {
        let state = state.filter(|s| s.finalized)?;
        if !self.finalized_by_us(&state, pending) {
            return Some(Err(BridgeError::AlreadyFinalized(
                request.request_id.to_string(),
            )));
        }
        let tx = pending.unwrap_or(FINALIZED_MARKER).to_string();
        info!(
            request_id = %request.request_id,
            chain = self.chain.chain(),
            tx_hash = %tx,
            "Request already finalized under our claim"
        );
        Some(Ok(tx))
    }

    /// Finalize `request` on the source chain and return the settlement tx.
    ///
    /// `pending` is a settlement recorded by an earlier attempt; it is polled
    /// before anything new is sent.
    pub async fn settle(
        &self,
        request: &BridgeRequest,
        delivery: &VerifiedDelivery,
        pending: Option<&str>,
        recorder: &dyn SettlementRecorder,
    ) -> Result<String, BridgeError> {
        let mut state = self.chain.source_state(request).await?;
        if let Some(outcome) = self.finalized_outcome(request, state, pending) {
            return outcome;
        }

        if let Some(tx) = pending {
            let outcome = self.watch(tx).await?;
            if outcome == WindowOutcome::Confirmed {
                self.log_settled(request, tx, &delivery.dest_tx);
                return Ok(tx.to_string());
            }
            warn!(
                request_id = %request.request_id,
                tx_hash = %tx,
                ?outcome,
                "Recorded settlement did not confirm"
            );
            state = self.chain.source_state(request).await?;
            if let Some(outcome) = self.finalized_outcome(request, state, pending) {
                return outcome;
            }
        }

        check_guards(request, state, &self.chain.solver_identity())?;
        let evidence_url = self.evidence_url(&delivery.dest_tx);
        let tx = self
            .chain
            .send_settlement(request, &delivery.dest_tx, &delivery.evidence_hash, &evidence_url)
            .await?;
        recorder.settlement_submitted(&tx).await?;
        info!(
            request_id = %request.request_id,
            chain = self.chain.chain(),
            tx_hash = %tx,
            "Settlement submitted"
        );

        let outcome = self.watch(&tx).await?;
        if outcome == WindowOutcome::Confirmed {
            self.log_settled(request, &tx, &delivery.dest_tx);
            return Ok(tx);
        }
        // A missed receipt does not mean the instruction did not land
        let state = self.chain.source_state(request).await?;
        if let Some(Ok(tx)) = self.finalized_outcome(request, state, Some(tx.as_str())) {
            return Ok(tx);
        }
        Err(BridgeError::SubmissionFailed(match outcome {
            WindowOutcome::Failed(reason) => format!("settlement {} failed: {}", tx, reason),
            _ => format!("settlement {} unconfirmed", tx),
        }))
    }

    fn log_settled(&self, request: &BridgeRequest, tx: &str, dest_tx: &str) {
        info!(
            request_id = %request.request_id,
            direction = %request.direction,
            chain = self.chain.chain(),
            tx_hash = %tx,
            dest_tx = %dest_tx,
            "Request settled"
        );
    }
}

/// Destination surface for attested canonical messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn chain(&self) -> &'static str;

    async fn deliver(
        &self,
        message: &CanonicalMessage,
        msg_id: &[u8; 32],
        asset: &PayoutAsset,
        amount: u128,
        attestation: &Attestation,
    ) -> Result<String, BridgeError>;

    async fn delivery_status(&self, tx: &str) -> Result<TxStatus, BridgeError>;
}
