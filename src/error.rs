//! Error taxonomy for the relay pipeline
//!
//! Protocol failures are terminal for the current attempt and are recorded on
//! the request. Infrastructure failures (`Rpc`, `NotYetVisible`, `Store`) are
//! retried locally with bounded backoff and never mark a request as failed.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Malformed address, amount or payload
    #[error("validation error: {0}")]
    Validation(String),

    #[error("active claim held by {solver} until {deadline}")]
    ActiveClaim { solver: String, deadline: u64 },

    #[error("bond {bond} is below the minimum of {minimum}")]
    BondTooLow { bond: u128, minimum: u128 },

    #[error("{0} is not an authorized solver")]
    NotAuthorizedNode(String),

    /// Settlement attempted after the claim deadline
    #[error("claim expired at {deadline}")]
    ClaimExpired { deadline: u64 },

    #[error("claim on request {request_id} belongs to {holder}")]
    NotClaimant { request_id: String, holder: String },

    #[error("request {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("request {0} does not exist on the source chain")]
    RequestNotFound(String),

    #[error("insufficient executor balance: available {available}, required {required}")]
    InsufficientBalance { available: u128, required: u128 },

    #[error("verification failed: recipient delta {delta} is below expected {expected}")]
    VerificationFailed { delta: i128, expected: u128 },

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("message id mismatch: carried {carried}, computed {computed}")]
    Tamper { carried: String, computed: String },

    #[error("message expired at {0}")]
    MessageExpired(u64),

    /// Another solver's claim transaction landed first
    #[error("claim race lost to {0}")]
    LostRace(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("transaction not yet visible: {0}")]
    NotYetVisible(String),

    #[error("state store error: {0}")]
    Store(String),

    /// The relay is already driving this request
    #[error("request {0} is already being processed")]
    InProgress(String),
}

impl BridgeError {
    /// Infrastructure failures that are retried locally
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Rpc(_) | BridgeError::NotYetVisible(_) | BridgeError::Store(_)
        )
    }

    /// Another solver owns the request; not a failure of this relay
    pub fn is_claim_contention(&self) -> bool {
        matches!(
            self,
            BridgeError::ActiveClaim { .. } | BridgeError::LostRace(_)
        )
    }

    /// Submission failures keep the request status so a later attempt can retry
    pub fn keeps_status(&self) -> bool {
        matches!(
            self,
            BridgeError::SubmissionFailed(_) | BridgeError::InsufficientBalance { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation",
            BridgeError::ActiveClaim { .. } => "active_claim",
            BridgeError::BondTooLow { .. } => "bond_too_low",
            BridgeError::NotAuthorizedNode(_) => "not_authorized",
            BridgeError::ClaimExpired { .. } => "claim_expired",
            BridgeError::NotClaimant { .. } => "not_claimant",
            BridgeError::AlreadyFinalized(_) => "already_finalized",
            BridgeError::RequestNotFound(_) => "request_not_found",
            BridgeError::InsufficientBalance { .. } => "insufficient_balance",
            BridgeError::VerificationFailed { .. } => "verification_failed",
            BridgeError::DecryptionFailed(_) => "decryption_failed",
            BridgeError::SubmissionFailed(_) => "submission_failed",
            BridgeError::Tamper { .. } => "tamper",
            BridgeError::MessageExpired(_) => "message_expired",
            BridgeError::LostRace(_) => "lost_race",
            BridgeError::Rpc(_) => "rpc",
            BridgeError::NotYetVisible(_) => "not_yet_visible",
            BridgeError::Store(_) => "store",
            BridgeError::InProgress(_) => "in_progress",
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        BridgeError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Rpc("timeout".into()).is_transient());
        assert!(BridgeError::NotYetVisible("sig".into()).is_transient());
        assert!(!BridgeError::ClaimExpired { deadline: 1 }.is_transient());
        assert!(!BridgeError::DecryptionFailed("layout".into()).is_transient());
    }

    #[test]
    fn test_payout_failures_keep_status() {
        assert!(BridgeError::SubmissionFailed("reverted".into()).keeps_status());
        assert!(BridgeError::InsufficientBalance {
            available: 1,
            required: 2
        }
        .keeps_status());
        assert!(!BridgeError::VerificationFailed {
            delta: 0,
            expected: 1
        }
        .keeps_status());
    }

    #[test]
    fn test_in_progress_is_neither_contention_nor_transient() {
        let e = BridgeError::InProgress("0x01".into());
        assert!(!e.is_claim_contention());
        assert!(!e.is_transient());
        assert_eq!(e.kind(), "in_progress");
    }

    #[test]
    fn test_verification_message_carries_delta() {
        let e = BridgeError::VerificationFailed {
            delta: 99,
            expected: 100,
        };
        assert!(e.to_string().contains("99"));
        assert!(e.to_string().contains("100"));
    }
}
