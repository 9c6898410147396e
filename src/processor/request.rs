//! Per-direction request pipeline
//!
//! `Claim → Resolve → Payout → Verify → Settle`. Every step persists its
//! result before the next one starts, and `next_step` derives the next step
//! from the persisted record alone, so live processing and startup replay
//! share one code path.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::in_flight::InFlightSet;
use super::ExternalDelivery;
use crate::claims::{ClaimCoordinator, ClaimOutcome};
use crate::error::BridgeError;
use crate::evidence::{EvidenceVerifier, VerifiedDelivery};
use crate::executor::{PayoutPlan, PayoutProgress, PayoutRecorder, TransferExecutor};
use crate::hash::{bytes32_to_hex, identity_to_bytes32, parse_bytes32};
use crate::metrics;
use crate::resolver::DestinationResolver;
use crate::retry::{with_retry, RetryConfig};
use crate::settlement::{SettlementRecorder, SettlementSubmitter};
use crate::store::{RequestRecord, StateStore, UpsertOutcome};
use crate::token_mapping::PayoutAsset;
use crate::types::{Direction, RequestId, RequestStatus, ResolvedDestination};
use crate::watchers::ObservedRequest;

/// Recorded in `claim_tx` when the relay already held the claim
pub const CLAIM_HELD_MARKER: &str = "held";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Claim,
    Resolve,
    Payout,
    Verify,
    Settle,
    Done,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Claim => "claim",
            Step::Resolve => "resolve",
            Step::Payout => "payout",
            Step::Verify => "verify",
            Step::Settle => "settle",
            Step::Done => "done",
        }
    }
}

/// The first step whose result is missing from the record. A record with
/// evidence stays on `Settle` until it is SETTLED; a recorded `settlement_tx`
/// is then polled rather than resent.
pub fn next_step(record: &RequestRecord) -> Step {
    if record.status.is_terminal() {
        return Step::Done;
    }
    if record.claim_tx.is_none() {
        Step::Claim
    } else if record.destination.is_none() {
        Step::Resolve
    } else if !record.payout_confirmed {
        Step::Payout
    } else if record.evidence_hash.is_none() {
        Step::Verify
    } else {
        Step::Settle
    }
}

/// Bonds posted by the pipeline
#[derive(Debug, Clone, Copy)]
pub struct BondSettings {
    /// Source-chain claim bond
    pub claim_bond: u128,
    /// Minimum bond carried by the claim + reseal instruction (lamports)
    pub resolve_bond: u64,
}

pub struct RequestPipeline {
    direction: Direction,
    store: Arc<dyn StateStore>,
    claims: ClaimCoordinator,
    resolver: Arc<dyn DestinationResolver>,
    executor: TransferExecutor,
    verifier: EvidenceVerifier,
    settlement: SettlementSubmitter,
    bonds: BondSettings,
    retry: RetryConfig,
    in_flight: InFlightSet,
}

/// Persists each payout submission onto the request row
struct RecordPayout<'a> {
    store: &'a dyn StateStore,
    template: RequestRecord,
}

#[async_trait]
impl PayoutRecorder for RecordPayout<'_> {
    async fn payout_submitted(&self, tx: &str, attempts: u32) -> Result<(), BridgeError> {
        let mut record = self.template.clone();
        record.payout_tx = Some(tx.to_string());
        record.payout_attempts = attempts as i32;
        record.payout_submitted_at = Some(Utc::now());
        record.updated_at = Utc::now();
        if self.store.upsert_request(&record).await? == UpsertOutcome::Stale {
            warn!(request_id = %record.id(), tx_hash = %tx, "Payout recorded against a closed request");
        }
        Ok(())
    }
}

/// Persists a sent settlement onto the request row, status unchanged
struct RecordSettlement<'a> {
    store: &'a dyn StateStore,
    template: RequestRecord,
}

#[async_trait]
impl SettlementRecorder for RecordSettlement<'_> {
    async fn settlement_submitted(&self, tx: &str) -> Result<(), BridgeError> {
        let mut record = self.template.clone();
        record.settlement_tx = Some(tx.to_string());
        record.updated_at = Utc::now();
        if self.store.upsert_request(&record).await? == UpsertOutcome::Stale {
            warn!(request_id = %record.id(), tx_hash = %tx, "Settlement recorded against a closed request");
        }
        Ok(())
    }
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        store: Arc<dyn StateStore>,
        claims: ClaimCoordinator,
        resolver: Arc<dyn DestinationResolver>,
        executor: TransferExecutor,
        verifier: EvidenceVerifier,
        settlement: SettlementSubmitter,
        bonds: BondSettings,
        retry: RetryConfig,
    ) -> Self {
        Self {
            direction,
            store,
            claims,
            resolver,
            executor,
            verifier,
            settlement,
            bonds,
            retry,
            in_flight: InFlightSet::new(direction.as_str()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Consume observed requests until the channel closes or shutdown
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ObservedRequest>,
        mut shutdown: mpsc::Receiver<()>,
        max_concurrent: usize,
    ) {
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        info!(direction = %self.direction, max_concurrent, "Request pipeline started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(direction = %self.direction, "Shutdown signal received, stopping request pipeline");
                    break;
                }
                observed = requests.recv() => {
                    let Some(observed) = observed else {
                        info!(direction = %self.direction, "Request channel closed");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        let id = observed.request.request_id;
                        if let Err(e) = pipeline.process(observed).await {
                            error!(request_id = %id, direction = %pipeline.direction, error = %e, "Request processing failed");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }

    /// Record a newly observed request and drive it as far as possible
    pub async fn process(&self, observed: ObservedRequest) -> Result<(), BridgeError> {
        if observed.request.direction != self.direction {
            return Err(BridgeError::Validation(format!(
                "{} request routed to {} pipeline",
                observed.request.direction, self.direction
            )));
        }
        let id = observed.request.request_id;
        let fresh = RequestRecord::received(observed.request, Some(observed.source_tx));
        if self.store.upsert_request(&fresh).await? == UpsertOutcome::Stale {
            debug!(request_id = %id, "Request already closed, skipping");
            return Ok(());
        }
        let record = self
            .store
            .get_request(self.direction, &id)
            .await?
            .ok_or_else(|| BridgeError::Store(format!("request {} vanished after upsert", id)))?;
        self.resume(record).await
    }

    /// Drive a persisted record from its next missing step
    pub async fn resume(&self, record: RequestRecord) -> Result<(), BridgeError> {
        let id = record.id();
        let Some(_guard) = self.in_flight.try_acquire(id.0) else {
            debug!(request_id = %id, "Request already in flight, skipping");
            return Ok(());
        };
        self.drive(record).await
    }

    async fn drive(&self, mut record: RequestRecord) -> Result<(), BridgeError> {
        loop {
            let step = next_step(&record);
            if step == Step::Done {
                return Ok(());
            }
            let started = Instant::now();
            let result = self.run_step(step, &mut record).await;
            metrics::observe_step(self.direction.as_str(), step.as_str(), started.elapsed().as_secs_f64());
            if let Err(e) = result {
                return self.handle_failure(step, record, e).await;
            }
        }
    }

    async fn run_step(&self, step: Step, record: &mut RequestRecord) -> Result<(), BridgeError> {
        match step {
            Step::Claim => self.claim(record).await,
            Step::Resolve => self.resolve(record).await,
            Step::Payout => self.payout(record).await,
            Step::Verify => self.verify(record).await,
            Step::Settle => self.settle(record).await,
            Step::Done => Ok(()),
        }
    }

    async fn persist(&self, record: &mut RequestRecord, status: RequestStatus) -> Result<(), BridgeError> {
        let previous = record.status;
        record.status = status;
        record.updated_at = Utc::now();
        match self.store.upsert_request(record).await? {
            UpsertOutcome::Applied => {
                if previous != status {
                    metrics::record_request_transition(self.direction.as_str(), status.as_str());
                    info!(
                        request_id = %record.id(),
                        direction = %self.direction,
                        status = status.as_str(),
                        "Request status updated"
                    );
                }
                Ok(())
            }
            UpsertOutcome::Stale => Err(BridgeError::Store(format!(
                "request {} was closed concurrently",
                record.id()
            ))),
        }
    }

    async fn handle_failure(
        &self,
        step: Step,
        mut record: RequestRecord,
        e: BridgeError,
    ) -> Result<(), BridgeError> {
        let id = record.id();
        metrics::record_pipeline_error(self.direction.as_str(), step.as_str(), e.kind());

        if e.is_claim_contention() {
            info!(request_id = %id, step = step.as_str(), reason = %e, "Request held by another solver, leaving it");
            return Ok(());
        }
        if e.is_transient() || e.keeps_status() {
            warn!(
                request_id = %id,
                step = step.as_str(),
                error = %e,
                status = record.status.as_str(),
                "Step failed, status kept for a later attempt"
            );
            record.last_error = Some(e.to_string());
            let status = record.status;
            // A store outage here is already the error being reported
            let _ = self.persist(&mut record, status).await;
            return Err(e);
        }

        error!(request_id = %id, step = step.as_str(), error = %e, "Request failed");
        record.last_error = Some(e.to_string());
        self.persist(&mut record, RequestStatus::Failed).await?;
        Err(e)
    }

    async fn claim(&self, record: &mut RequestRecord) -> Result<(), BridgeError> {
        let request = record.request.clone();
        let outcome = with_retry(&self.retry, |_| self.claims.try_claim(&request, self.bonds.claim_bond)).await?;
        record.claim_tx = Some(match outcome {
            ClaimOutcome::Secured { tx } => tx,
            ClaimOutcome::AlreadyOurs => CLAIM_HELD_MARKER.to_string(),
        });
        self.persist(record, RequestStatus::Received).await
    }

    async fn resolve(&self, record: &mut RequestRecord) -> Result<(), BridgeError> {
        let owner = record.request.resolution_owner()?;
        let solana_id = record.id().low_u64();
        let destination = with_retry(&self.retry, |_| {
            self.resolver
                .resolve(solana_id, &owner, self.direction, self.bonds.resolve_bond)
        })
        .await?;
        info!(
            request_id = %record.id(),
            destination = %destination.render(self.direction),
            "Destination resolved"
        );
        record.destination = Some(bytes32_to_hex(&destination.0));
        self.persist(record, RequestStatus::Received).await
    }

    fn plan(&self, record: &RequestRecord) -> Result<PayoutPlan, BridgeError> {
        let mut plan = self
            .executor
            .plan(self.direction, &record.request.source_token, record.request.amount)?;
        if let Some(recorded) = &record.payout_amount {
            plan.amount = recorded
                .parse()
                .map_err(|_| BridgeError::Store(format!("bad payout amount {}", recorded)))?;
        }
        Ok(plan)
    }

    fn destination(record: &RequestRecord) -> Result<ResolvedDestination, BridgeError> {
        let raw = record
            .destination
            .as_deref()
            .ok_or_else(|| BridgeError::Validation("destination not resolved".to_string()))?;
        Ok(ResolvedDestination(parse_bytes32(raw)?))
    }

    async fn payout(&self, record: &mut RequestRecord) -> Result<(), BridgeError> {
        let destination = Self::destination(record)?;
        let plan = self.plan(record)?;
        record.payout_amount = Some(plan.amount.to_string());

        let tx = with_retry(&self.retry, |_| {
            let plan = &plan;
            let destination = &destination;
            let template = record.clone();
            async move {
                // Re-read so a retry sees any submission recorded by the last attempt
                let current = self
                    .store
                    .get_request(self.direction, &template.id())
                    .await?
                    .unwrap_or_else(|| template.clone());
                let progress = PayoutProgress {
                    tx: current.payout_tx.clone(),
                    attempts: current.payout_attempts.max(0) as u32,
                    submitted_at: current.payout_submitted_at,
                };
                let recorder = RecordPayout {
                    store: self.store.as_ref(),
                    template,
                };
                self.executor.payout(destination, plan, progress, &recorder).await
            }
        })
        .await?;

        if let Some(stored) = self.store.get_request(self.direction, &record.id()).await? {
            record.payout_attempts = stored.payout_attempts;
            record.payout_submitted_at = stored.payout_submitted_at;
        }
        record.payout_tx = Some(tx);
        record.payout_confirmed = true;
        record.last_error = None;
        self.persist(record, RequestStatus::Received).await
    }

    /// Recipient word and asset id as they appear in destination evidence
    fn evidence_keys(
        &self,
        destination: &ResolvedDestination,
        asset: &PayoutAsset,
    ) -> Result<([u8; 32], Option<[u8; 32]>), BridgeError> {
        let asset = match asset.token_address() {
            Some(address) => Some(identity_to_bytes32(address)?),
            None => None,
        };
        Ok((destination.0, asset))
    }

    async fn verify(&self, record: &mut RequestRecord) -> Result<(), BridgeError> {
        let destination = Self::destination(record)?;
        let plan = self.plan(record)?;
        let dest_tx = record
            .payout_tx
            .clone()
            .ok_or_else(|| BridgeError::Validation("payout transaction missing".to_string()))?;
        let (recipient, asset) = self.evidence_keys(&destination, &plan.asset)?;
        let delivery = self
            .verifier
            .verify_delivery(&dest_tx, &recipient, plan.amount, asset.as_ref())
            .await?;
        record.evidence_hash = Some(bytes32_to_hex(&delivery.evidence_hash));
        self.persist(record, RequestStatus::Verified).await
    }

    async fn settle(&self, record: &mut RequestRecord) -> Result<(), BridgeError> {
        let delivery = VerifiedDelivery {
            dest_tx: record
                .payout_tx
                .clone()
                .ok_or_else(|| BridgeError::Validation("payout transaction missing".to_string()))?,
            delta: self.plan(record)?.amount as i128,
            evidence_hash: parse_bytes32(record.evidence_hash.as_deref().unwrap_or_default())?,
        };
        let tx = with_retry(&self.retry, |_| self.settle_once(record.clone(), &delivery)).await?;
        self.record_settled(record, tx).await
    }

    /// One settlement attempt, resuming whatever the last attempt recorded
    async fn settle_once(
        &self,
        template: RequestRecord,
        delivery: &VerifiedDelivery,
    ) -> Result<String, BridgeError> {
        let current = self
            .store
            .get_request(self.direction, &template.id())
            .await?
            .unwrap_or_else(|| template.clone());
        let pending = current.settlement_tx.or(template.settlement_tx.clone());
        let recorder = RecordSettlement {
            store: self.store.as_ref(),
            template: template.clone(),
        };
        self.settlement
            .settle(&template.request, delivery, pending.as_deref(), &recorder)
            .await
    }

    async fn record_settled(&self, record: &mut RequestRecord, tx: String) -> Result<(), BridgeError> {
        record.settlement_tx = Some(tx);
        record.request.finalized = true;
        record.last_error = None;
        self.persist(record, RequestStatus::Settled).await
    }

    /// Verify externally-produced delivery evidence and settle on it
    pub async fn verify_external(&self, delivery: ExternalDelivery) -> Result<RequestRecord, BridgeError> {
        let id: RequestId = delivery.request_id;
        let Some(_guard) = self.in_flight.try_acquire(id.0) else {
            return Err(BridgeError::InProgress(id.to_string()));
        };
        let mut record = self
            .store
            .get_request(self.direction, &id)
            .await?
            .ok_or_else(|| BridgeError::RequestNotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Err(BridgeError::AlreadyFinalized(id.to_string()));
        }

        let recipient = identity_to_bytes32(&delivery.recipient)?;
        let destination = ResolvedDestination::for_direction(recipient, self.direction);
        if let Some(known) = &record.destination {
            if parse_bytes32(known)? != destination.0 {
                return Err(BridgeError::Validation(format!(
                    "recipient {} does not match resolved destination",
                    delivery.recipient
                )));
            }
        }
        let plan = self.plan(&record)?;
        if let Some(amount) = delivery.amount {
            if amount != plan.amount {
                return Err(BridgeError::Validation(format!(
                    "amount {} does not match planned payout {}",
                    amount, plan.amount
                )));
            }
        }

        let (recipient, asset) = self.evidence_keys(&destination, &plan.asset)?;
        let verified = match self
            .verifier
            .verify_delivery(&delivery.dest_tx, &recipient, plan.amount, asset.as_ref())
            .await
        {
            Ok(verified) => verified,
            Err(e @ BridgeError::VerificationFailed { .. }) => {
                warn!(request_id = %id, dest_tx = %delivery.dest_tx, error = %e, "Submitted evidence rejected");
                record.last_error = Some(e.to_string());
                self.persist(&mut record, RequestStatus::Failed).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        record.destination = Some(bytes32_to_hex(&destination.0));
        record.payout_amount = Some(plan.amount.to_string());
        record.payout_tx = Some(delivery.dest_tx.clone());
        record.payout_confirmed = true;
        record.evidence_hash = Some(bytes32_to_hex(&verified.evidence_hash));
        self.persist(&mut record, RequestStatus::Verified).await?;

        match self.settle_once(record.clone(), &verified).await {
            Ok(tx) => {
                self.record_settled(&mut record, tx).await?;
                Ok(record)
            }
            Err(e) if e.is_transient() || e.keeps_status() => {
                warn!(request_id = %id, error = %e, "Settlement pending, left for the reprocessor");
                record.last_error = Some(e.to_string());
                let status = record.status;
                let _ = self.persist(&mut record, status).await;
                Err(e)
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Settlement rejected");
                record.last_error = Some(e.to_string());
                self.persist(&mut record, RequestStatus::Failed).await?;
                Err(e)
            }
        }
    }
}
