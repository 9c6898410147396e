//! Durable, forward-only state for requests and messages
//!
//! Every write is an upsert keyed by the natural id (`requestId` per
//! direction, `msgId` for messages). A write that would move a record
//! backwards, or touch a terminal record, is rejected as `Stale` and leaves
//! the stored row unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::message::CanonicalMessage;
use crate::settlement::Attestation;
use crate::types::{BridgeRequest, Direction, MsgStatus, RequestId, RequestStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Rejected by the forward-only rule; the stored row is unchanged
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    #[serde(flatten)]
    pub request: BridgeRequest,
    pub status: RequestStatus,
    pub source_tx: Option<String>,
    pub claim_tx: Option<String>,
    /// Resolved destination as a 0x word
    pub destination: Option<String>,
    pub payout_amount: Option<String>,
    pub payout_tx: Option<String>,
    pub payout_submitted_at: Option<DateTime<Utc>>,
    pub payout_attempts: i32,
    pub payout_confirmed: bool,
    pub evidence_hash: Option<String>,
    pub settlement_tx: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn received(request: BridgeRequest, source_tx: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            request,
            status: RequestStatus::Received,
            source_tx,
            claim_tx: None,
            destination: None,
            payout_amount: None,
            payout_tx: None,
            payout_submitted_at: None,
            payout_attempts: 0,
            payout_confirmed: false,
            evidence_hash: None,
            settlement_tx: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.request_id
    }

    pub fn direction(&self) -> Direction {
        self.request.direction
    }

    /// Fold a newer write into this record; `None` fields never erase data
    pub fn merge_from(&mut self, newer: &RequestRecord) {
        fn keep(slot: &mut Option<String>, newer: &Option<String>) {
            if newer.is_some() {
                slot.clone_from(newer);
            }
        }
        self.status = newer.status;
        self.request.finalized |= newer.request.finalized;
        keep(&mut self.source_tx, &newer.source_tx);
        keep(&mut self.claim_tx, &newer.claim_tx);
        keep(&mut self.destination, &newer.destination);
        keep(&mut self.payout_amount, &newer.payout_amount);
        keep(&mut self.payout_tx, &newer.payout_tx);
        keep(&mut self.evidence_hash, &newer.evidence_hash);
        keep(&mut self.settlement_tx, &newer.settlement_tx);
        keep(&mut self.last_error, &newer.last_error);
        if newer.payout_submitted_at.is_some() {
            self.payout_submitted_at = newer.payout_submitted_at;
        }
        self.payout_attempts = self.payout_attempts.max(newer.payout_attempts);
        self.payout_confirmed |= newer.payout_confirmed;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgRecord {
    #[serde(with = "crate::hash::serde_hex32")]
    pub msg_id: [u8; 32],
    pub message: CanonicalMessage,
    pub status: MsgStatus,
    pub source_tx: Option<String>,
    pub attestation: Option<Attestation>,
    pub delivery_tx: Option<String>,
    pub delivery_submitted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MsgRecord {
    pub fn observed(msg_id: [u8; 32], message: CanonicalMessage, source_tx: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            msg_id,
            message,
            status: MsgStatus::Observed,
            source_tx,
            attestation: None,
            delivery_tx: None,
            delivery_submitted_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn merge_from(&mut self, newer: &MsgRecord) {
        self.status = newer.status;
        if newer.source_tx.is_some() {
            self.source_tx.clone_from(&newer.source_tx);
        }
        if newer.attestation.is_some() {
            self.attestation = newer.attestation;
        }
        if newer.delivery_tx.is_some() {
            self.delivery_tx.clone_from(&newer.delivery_tx);
        }
        if newer.delivery_submitted_at.is_some() {
            self.delivery_submitted_at = newer.delivery_submitted_at;
        }
        if newer.last_error.is_some() {
            self.last_error.clone_from(&newer.last_error);
        }
        self.updated_at = Utc::now();
    }
}

/// Injectable persistence for every pipeline component
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_request(
        &self,
        direction: Direction,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, BridgeError>;

    async fn upsert_request(&self, record: &RequestRecord) -> Result<UpsertOutcome, BridgeError>;

    async fn find_requests_by_status(
        &self,
        direction: Direction,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>, BridgeError>;

    async fn get_message(&self, msg_id: &[u8; 32]) -> Result<Option<MsgRecord>, BridgeError>;

    async fn upsert_message(&self, record: &MsgRecord) -> Result<UpsertOutcome, BridgeError>;

    async fn find_messages_by_status(
        &self,
        statuses: &[MsgStatus],
    ) -> Result<Vec<MsgRecord>, BridgeError>;
}
