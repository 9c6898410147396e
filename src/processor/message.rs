//! Attested-messaging pipeline
//!
//! `Observed → Attested → Submitted → Confirmed`, each transition persisted
//! before the next side effect. Deliveries are never resubmitted: a delivery
//! that outlives its receipt window stays `Submitted` for the reprocessor.

use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::in_flight::InFlightSet;
use crate::claims::SubmissionPolicy;
use crate::error::BridgeError;
use crate::hash::{bytes32_to_evm_address, bytes32_to_hex};
use crate::metrics;
use crate::retry::{watch_submission, with_retry, RetryConfig, WindowOutcome};
use crate::settlement::{AttestationProvider, MessageSink};
use crate::store::{MsgRecord, StateStore, UpsertOutcome};
use crate::token_mapping::TokenMappingTable;
use crate::types::{unix_now, Direction, MsgStatus};
use crate::watchers::ObservedMessage;

/// Source token as the mapping table keys it
pub fn origin_token_key(direction: Direction, origin_token: &[u8; 32]) -> String {
    match direction {
        Direction::EvmToSol => bytes32_to_evm_address(origin_token),
        Direction::SolToEvm => Pubkey::new_from_array(*origin_token).to_string(),
    }
}

pub struct MessageProcessor {
    store: Arc<dyn StateStore>,
    attestor: Arc<dyn AttestationProvider>,
    evm_sink: Arc<dyn MessageSink>,
    solana_sink: Arc<dyn MessageSink>,
    mappings: Arc<TokenMappingTable>,
    policy: SubmissionPolicy,
    retry: RetryConfig,
    in_flight: InFlightSet,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn StateStore>,
        attestor: Arc<dyn AttestationProvider>,
        evm_sink: Arc<dyn MessageSink>,
        solana_sink: Arc<dyn MessageSink>,
        mappings: Arc<TokenMappingTable>,
        policy: SubmissionPolicy,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            attestor,
            evm_sink,
            solana_sink,
            mappings,
            policy,
            retry,
            in_flight: InFlightSet::new("message"),
        }
    }

    fn sink(&self, direction: Direction) -> &dyn MessageSink {
        match direction {
            Direction::SolToEvm => self.evm_sink.as_ref(),
            Direction::EvmToSol => self.solana_sink.as_ref(),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<ObservedMessage>,
        mut shutdown: mpsc::Receiver<()>,
        max_concurrent: usize,
    ) {
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        info!(max_concurrent, "Message processor started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping message processor");
                    break;
                }
                observed = messages.recv() => {
                    let Some(observed) = observed else {
                        info!("Message channel closed");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let processor = self.clone();
                    tokio::spawn(async move {
                        let msg_id = bytes32_to_hex(&observed.msg_id);
                        if let Err(e) = processor.process(observed).await {
                            error!(msg_id = %msg_id, error = %e, "Message processing failed");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }

    /// Record an observed message and drive it to a terminal or parked state
    pub async fn process(&self, observed: ObservedMessage) -> Result<(), BridgeError> {
        if let Err(e) = observed.message.verify_id(&observed.msg_id) {
            warn!(error = %e, tx_hash = %observed.source_tx, "Dropping tampered message");
            metrics::record_message_observed("tamper");
            return Err(e);
        }

        if let Some(existing) = self.store.get_message(&observed.msg_id).await? {
            if existing.status != MsgStatus::Observed {
                debug!(
                    msg_id = %bytes32_to_hex(&observed.msg_id),
                    status = existing.status.as_str(),
                    "Message already past observation, skipping"
                );
                return Ok(());
            }
            return self.resume(existing).await;
        }

        let record = MsgRecord::observed(observed.msg_id, observed.message, Some(observed.source_tx));
        if self.store.upsert_message(&record).await? == UpsertOutcome::Stale {
            return Ok(());
        }
        metrics::record_message_transition(MsgStatus::Observed.as_str());
        self.resume(record).await
    }

    /// Continue from the persisted status
    pub async fn resume(&self, record: MsgRecord) -> Result<(), BridgeError> {
        let Some(_guard) = self.in_flight.try_acquire(record.msg_id) else {
            debug!(msg_id = %bytes32_to_hex(&record.msg_id), "Message already in flight, skipping");
            return Ok(());
        };
        self.drive(record).await
    }

    async fn drive(&self, mut record: MsgRecord) -> Result<(), BridgeError> {
        loop {
            let started = Instant::now();
            let step = record.status.as_str();
            let result = match record.status {
                MsgStatus::Observed => self.attest(&mut record).await,
                MsgStatus::Attested => self.deliver(&mut record).await,
                MsgStatus::Submitted => match self.await_delivery(&mut record).await {
                    Ok(true) => Ok(()),
                    // Parked until the reprocessor looks again
                    Ok(false) => return Ok(()),
                    Err(e) => Err(e),
                },
                MsgStatus::Confirmed | MsgStatus::Failed => return Ok(()),
            };
            metrics::observe_step(record.message.dir.as_str(), step, started.elapsed().as_secs_f64());
            if let Err(e) = result {
                return self.handle_failure(record, e).await;
            }
        }
    }

    async fn persist(&self, record: &mut MsgRecord, status: MsgStatus) -> Result<(), BridgeError> {
        let previous = record.status;
        record.status = status;
        record.updated_at = Utc::now();
        match self.store.upsert_message(record).await? {
            UpsertOutcome::Applied => {
                if previous != status {
                    metrics::record_message_transition(status.as_str());
                    info!(
                        msg_id = %bytes32_to_hex(&record.msg_id),
                        direction = %record.message.dir,
                        status = status.as_str(),
                        "Message status updated"
                    );
                }
                Ok(())
            }
            UpsertOutcome::Stale => Err(BridgeError::Store(format!(
                "message {} was closed concurrently",
                bytes32_to_hex(&record.msg_id)
            ))),
        }
    }

    async fn handle_failure(&self, mut record: MsgRecord, e: BridgeError) -> Result<(), BridgeError> {
        let msg_id = bytes32_to_hex(&record.msg_id);
        metrics::record_pipeline_error(record.message.dir.as_str(), record.status.as_str(), e.kind());
        record.last_error = Some(e.to_string());
        if e.is_transient() {
            warn!(msg_id = %msg_id, status = record.status.as_str(), error = %e, "Message step failed, status kept");
            let status = record.status;
            let _ = self.persist(&mut record, status).await;
            return Err(e);
        }
        error!(msg_id = %msg_id, error = %e, "Message failed");
        self.persist(&mut record, MsgStatus::Failed).await?;
        Err(e)
    }

    fn check_expiry(record: &MsgRecord) -> Result<(), BridgeError> {
        if record.message.is_expired(unix_now()) {
            return Err(BridgeError::MessageExpired(record.message.expiry));
        }
        Ok(())
    }

    async fn attest(&self, record: &mut MsgRecord) -> Result<(), BridgeError> {
        Self::check_expiry(record)?;
        let digest = record.msg_id;
        let attestation = with_retry(&self.retry, |_| self.attestor.sign_digest(&digest)).await?;
        record.attestation = Some(attestation);
        self.persist(record, MsgStatus::Attested).await
    }

    async fn deliver(&self, record: &mut MsgRecord) -> Result<(), BridgeError> {
        Self::check_expiry(record)?;
        let attestation = record
            .attestation
            .ok_or_else(|| BridgeError::Validation("attested message has no signature".to_string()))?;
        let direction = record.message.dir;
        let token = origin_token_key(direction, &record.message.origin_token);
        let (route, converted) = self.mappings.convert(direction, &token, record.message.amount)?;
        if converted.amount == 0 {
            return Err(BridgeError::Validation(format!(
                "amount {} converts to zero destination units",
                record.message.amount
            )));
        }

        let sink = self.sink(direction);
        let tx = sink
            .deliver(&record.message, &record.msg_id, &route.asset, converted.amount, &attestation)
            .await?;
        info!(
            msg_id = %bytes32_to_hex(&record.msg_id),
            chain = sink.chain(),
            tx_hash = %tx,
            amount = %converted.amount,
            "Message delivery submitted"
        );
        record.delivery_tx = Some(tx);
        record.delivery_submitted_at = Some(Utc::now());
        self.persist(record, MsgStatus::Submitted).await
    }

    /// `Ok(false)` when the receipt window elapsed without an outcome
    async fn await_delivery(&self, record: &mut MsgRecord) -> Result<bool, BridgeError> {
        let tx = record
            .delivery_tx
            .clone()
            .ok_or_else(|| BridgeError::Validation("submitted message has no delivery tx".to_string()))?;
        let sink = self.sink(record.message.dir);
        let outcome = watch_submission(self.policy.receipt_window, self.policy.poll_interval, || {
            sink.delivery_status(&tx)
        })
        .await?;
        match outcome {
            WindowOutcome::Confirmed => {
                record.last_error = None;
                self.persist(record, MsgStatus::Confirmed).await?;
                Ok(true)
            }
            WindowOutcome::Failed(reason) => Err(BridgeError::SubmissionFailed(format!(
                "delivery {} reverted: {}",
                tx, reason
            ))),
            WindowOutcome::Elapsed => {
                warn!(
                    msg_id = %bytes32_to_hex(&record.msg_id),
                    tx_hash = %tx,
                    "Delivery unconfirmed after receipt window"
                );
                Ok(false)
            }
        }
    }
}
