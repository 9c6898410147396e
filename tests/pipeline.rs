//! Cross-component scenarios driven through in-memory fakes of every chain
//! trait. No network or database is required.

use async_trait::async_trait;
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay::claims::{ClaimCoordinator, ClaimLedger, ClaimRules, SubmissionPolicy};
use relay::error::BridgeError;
use relay::evidence::{DeliveryEvidence, EvidenceSource, EvidenceVerifier, ValueTransfer};
use relay::executor::{PayoutChain, TransferExecutor};
use relay::hash::bytes32_to_hex;
use relay::message::CanonicalMessage;
use relay::processor::{
    BondSettings, ExternalDelivery, MessageProcessor, PipelineSet, RequestPipeline, VerificationService,
};
use relay::reprocessor::Reprocessor;
use relay::resolver::DestinationResolver;
use relay::retry::RetryConfig;
use relay::settlement::{
    Attestation, AttestationProvider, LocalKeyAttestor, MessageSink, SettlementChain, SettlementSubmitter,
    SourceState, FINALIZED_MARKER,
};
use relay::store::{MemoryStore, MsgRecord, RequestRecord, StateStore};
use relay::token_mapping::{PayoutAsset, TokenMappingTable};
use relay::types::{
    unix_now, BridgeRequest, Claim, Direction, MsgStatus, RequestId, RequestStatus, ResolvedDestination,
    TxStatus,
};
use relay::watchers::{ObservedMessage, ObservedRequest};

const RELAY: [u8; 32] = [0x0e; 32];
const RIVAL: [u8; 32] = [0x0f; 32];
const DESTINATION: [u8; 32] = [0x09; 32];
/// 2e12 wei converts to 2000 lamports
const SOURCE_AMOUNT: u128 = 2_000_000_000_000;
const PAYOUT_AMOUNT: u128 = 2_000;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerState {
    claim: Option<Claim>,
    finalized: bool,
    claim_submissions: u32,
    settlements: Vec<(RequestId, String, [u8; 32])>,
    /// Settlements that land but whose send reply is lost
    lost_replies: u32,
    /// Settlement receipts never show up
    settlement_pending: bool,
}

/// Source chain: claim ledger and settlement target
struct FakeSource {
    rival_wins: bool,
    state: Mutex<LedgerState>,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rival_wins: false,
            state: Mutex::default(),
        })
    }

    fn rival_wins() -> Arc<Self> {
        Arc::new(Self {
            rival_wins: true,
            state: Mutex::default(),
        })
    }

    fn active_claim(solver: [u8; 32]) -> Claim {
        let now = unix_now();
        Claim {
            solver,
            bond: 1,
            claimed_at: now,
            deadline: now + 900,
        }
    }

    fn seed_claim(&self, solver: [u8; 32]) {
        self.state.lock().unwrap().claim = Some(Self::active_claim(solver));
    }

    fn finalize(&self) {
        self.state.lock().unwrap().finalized = true;
    }

    fn lose_settlement_replies(&self, count: u32) {
        self.state.lock().unwrap().lost_replies = count;
    }

    fn hold_settlement_receipts(&self) {
        self.state.lock().unwrap().settlement_pending = true;
    }

    fn claim_submissions(&self) -> u32 {
        self.state.lock().unwrap().claim_submissions
    }

    fn settlements(&self) -> Vec<(RequestId, String, [u8; 32])> {
        self.state.lock().unwrap().settlements.clone()
    }
}

#[async_trait]
impl ClaimLedger for FakeSource {
    fn chain(&self) -> &'static str {
        "source"
    }

    fn solver_identity(&self) -> [u8; 32] {
        RELAY
    }

    async fn current_claim(&self, _request: &BridgeRequest) -> Result<Option<Claim>, BridgeError> {
        Ok(self.state.lock().unwrap().claim)
    }

    async fn submit_claim(
        &self,
        _request: &BridgeRequest,
        _bond: u128,
        _replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let mut state = self.state.lock().unwrap();
        state.claim_submissions += 1;
        let winner = if self.rival_wins { RIVAL } else { RELAY };
        state.claim = Some(Self::active_claim(winner));
        Ok(format!("0xclaim{}", state.claim_submissions))
    }

    async fn claim_status(&self, _tx: &str) -> Result<TxStatus, BridgeError> {
        Ok(TxStatus::Confirmed)
    }
}

#[async_trait]
impl SettlementChain for FakeSource {
    fn chain(&self) -> &'static str {
        "source"
    }

    fn solver_identity(&self) -> [u8; 32] {
        RELAY
    }

    async fn source_state(&self, _request: &BridgeRequest) -> Result<Option<SourceState>, BridgeError> {
        let state = self.state.lock().unwrap();
        Ok(Some(SourceState {
            finalized: state.finalized,
            claim: state.claim,
        }))
    }

    async fn send_settlement(
        &self,
        request: &BridgeRequest,
        dest_tx: &str,
        evidence_hash: &[u8; 32],
        _evidence_url: &str,
    ) -> Result<String, BridgeError> {
        let mut state = self.state.lock().unwrap();
        if state.finalized {
            return Err(BridgeError::SubmissionFailed("execution reverted: finalized".into()));
        }
        if !state.settlement_pending {
            state.finalized = true;
        }
        state
            .settlements
            .push((request.request_id, dest_tx.to_string(), *evidence_hash));
        if state.lost_replies > 0 {
            state.lost_replies -= 1;
            return Err(BridgeError::Rpc("connection reset".into()));
        }
        Ok("0xsettle".to_string())
    }

    async fn settlement_status(&self, _tx: &str) -> Result<TxStatus, BridgeError> {
        if self.state.lock().unwrap().settlement_pending {
            return Ok(TxStatus::Pending);
        }
        Ok(TxStatus::Confirmed)
    }
}

#[derive(Default)]
struct DestinationState {
    balance: u128,
    /// Credit observed in evidence per tx; defaults to the paid amount
    credited: HashMap<String, ([u8; 32], u128)>,
    short_by: u128,
    transfers: Vec<(ResolvedDestination, u128)>,
    deliveries: Vec<([u8; 32], u128)>,
}

/// Destination chain: payout, evidence and message sink
struct FakeDestination {
    state: Mutex<DestinationState>,
}

impl FakeDestination {
    fn with_balance(balance: u128) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DestinationState {
                balance,
                ..Default::default()
            }),
        })
    }

    fn seed_transfer(&self, tx: &str, to: [u8; 32], amount: u128) {
        self.state
            .lock()
            .unwrap()
            .credited
            .insert(tx.to_string(), (to, amount));
    }

    fn short_by(&self, amount: u128) {
        self.state.lock().unwrap().short_by = amount;
    }

    fn transfer_count(&self) -> usize {
        self.state.lock().unwrap().transfers.len()
    }

    fn delivery_count(&self) -> usize {
        self.state.lock().unwrap().deliveries.len()
    }
}

#[async_trait]
impl PayoutChain for FakeDestination {
    fn chain(&self) -> &'static str {
        "destination"
    }

    async fn balance(&self, _asset: &PayoutAsset) -> Result<u128, BridgeError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn submit_transfer(
        &self,
        to: &ResolvedDestination,
        _asset: &PayoutAsset,
        amount: u128,
        _replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let mut state = self.state.lock().unwrap();
        state.transfers.push((*to, amount));
        let tx = format!("0xpayout{}", state.transfers.len());
        let credited = amount.saturating_sub(state.short_by);
        state.credited.insert(tx.clone(), (to.0, credited));
        Ok(tx)
    }

    async fn transfer_status(&self, _tx: &str) -> Result<TxStatus, BridgeError> {
        Ok(TxStatus::Confirmed)
    }
}

#[async_trait]
impl EvidenceSource for FakeDestination {
    fn chain(&self) -> &'static str {
        "destination"
    }

    async fn fetch_evidence(&self, tx: &str) -> Result<DeliveryEvidence, BridgeError> {
        let state = self.state.lock().unwrap();
        let (to, amount) = state
            .credited
            .get(tx)
            .copied()
            .ok_or_else(|| BridgeError::NotYetVisible(tx.to_string()))?;
        Ok(DeliveryEvidence::Transfers(vec![ValueTransfer {
            from: [0x01; 32],
            to,
            asset: None,
            amount,
        }]))
    }
}

#[async_trait]
impl MessageSink for FakeDestination {
    fn chain(&self) -> &'static str {
        "destination"
    }

    async fn deliver(
        &self,
        message: &CanonicalMessage,
        _msg_id: &[u8; 32],
        _asset: &PayoutAsset,
        amount: u128,
        _attestation: &Attestation,
    ) -> Result<String, BridgeError> {
        let mut state = self.state.lock().unwrap();
        state.deliveries.push((message.recipient, amount));
        Ok(format!("0xdelivery{}", state.deliveries.len()))
    }

    async fn delivery_status(&self, _tx: &str) -> Result<TxStatus, BridgeError> {
        Ok(TxStatus::Confirmed)
    }
}

struct FixedResolver;

#[async_trait]
impl DestinationResolver for FixedResolver {
    async fn resolve(
        &self,
        _request_id: u64,
        _owner: &[u8; 32],
        direction: Direction,
        _min_bond: u64,
    ) -> Result<ResolvedDestination, BridgeError> {
        Ok(ResolvedDestination::for_direction(DESTINATION, direction))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn policy() -> SubmissionPolicy {
    SubmissionPolicy {
        receipt_window: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
        max_replacements: 1,
    }
}

fn retry() -> RetryConfig {
    RetryConfig::fixed(2, Duration::from_millis(1))
}

fn rules() -> ClaimRules {
    ClaimRules {
        min_bond: 1,
        slash_bps: 5000,
        window_secs: 900,
        authorized: HashSet::from([RELAY]),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<FakeSource>,
    destination: Arc<FakeDestination>,
    pipeline: Arc<RequestPipeline>,
}

fn pipeline_for(
    direction: Direction,
    store: Arc<MemoryStore>,
    source: Arc<FakeSource>,
    destination: Arc<FakeDestination>,
) -> Arc<RequestPipeline> {
    Arc::new(RequestPipeline::new(
        direction,
        store,
        ClaimCoordinator::new(source.clone(), rules(), policy(), 64),
        Arc::new(FixedResolver),
        TransferExecutor::new(destination.clone(), Arc::new(TokenMappingTable::default()), policy()),
        EvidenceVerifier::new(destination, 2, Duration::from_millis(1)),
        SettlementSubmitter::new(source, "").with_policy(policy()),
        BondSettings {
            claim_bond: 1,
            resolve_bond: 1,
        },
        retry(),
    ))
}

fn harness(source: Arc<FakeSource>, destination: Arc<FakeDestination>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_for(Direction::EvmToSol, store.clone(), source.clone(), destination.clone());
    Harness {
        store,
        source,
        destination,
        pipeline,
    }
}

fn evm_request(id: u64) -> BridgeRequest {
    BridgeRequest {
        request_id: RequestId::from_u64(id),
        direction: Direction::EvmToSol,
        sender: "0x1111111111111111111111111111111111111111".into(),
        source_token: "0x0000000000000000000000000000000000000000".into(),
        amount: SOURCE_AMOUNT,
        destination_handle: [0x22; 32],
        created_at: 1_700_000_000,
        finalized: false,
        fee: 0,
    }
}

fn observed(id: u64) -> ObservedRequest {
    ObservedRequest {
        request: evm_request(id),
        source_tx: format!("0xsource{}", id),
    }
}

async fn stored(h: &Harness, id: u64) -> RequestRecord {
    h.store
        .get_request(Direction::EvmToSol, &RequestId::from_u64(id))
        .await
        .unwrap()
        .expect("record persisted")
}

// ---------------------------------------------------------------------------
// Request pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_runs_to_settlement() {
    let h = harness(FakeSource::new(), FakeDestination::with_balance(1_000_000));
    h.pipeline.process(observed(1)).await.unwrap();

    let record = stored(&h, 1).await;
    assert_eq!(record.status, RequestStatus::Settled);
    assert!(record.request.finalized);
    assert_eq!(record.source_tx.as_deref(), Some("0xsource1"));
    assert_eq!(record.claim_tx.as_deref(), Some("0xclaim1"));
    assert_eq!(record.destination, Some(bytes32_to_hex(&DESTINATION)));
    assert_eq!(record.payout_amount.as_deref(), Some("2000"));
    assert_eq!(record.payout_tx.as_deref(), Some("0xpayout1"));
    assert!(record.payout_confirmed);
    assert_eq!(record.settlement_tx.as_deref(), Some("0xsettle"));
    assert!(record.last_error.is_none());

    let settlements = h.source.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].1, "0xpayout1");
    assert_eq!(Some(bytes32_to_hex(&settlements[0].2)), record.evidence_hash);
    assert_eq!(h.destination.transfer_count(), 1);
}

#[tokio::test]
async fn test_duplicate_observation_does_not_pay_twice() {
    let h = harness(FakeSource::new(), FakeDestination::with_balance(1_000_000));
    h.pipeline.process(observed(2)).await.unwrap();
    h.pipeline.process(observed(2)).await.unwrap();

    assert_eq!(stored(&h, 2).await.status, RequestStatus::Settled);
    assert_eq!(h.destination.transfer_count(), 1);
    assert_eq!(h.source.claim_submissions(), 1);
}

#[tokio::test]
async fn test_short_delivery_fails_request() {
    let destination = FakeDestination::with_balance(1_000_000);
    destination.short_by(1);
    let h = harness(FakeSource::new(), destination);

    let err = h.pipeline.process(observed(3)).await.unwrap_err();
    assert!(matches!(err, BridgeError::VerificationFailed { delta: 1999, expected: 2000 }));

    let record = stored(&h, 3).await;
    assert_eq!(record.status, RequestStatus::Failed);
    assert!(record.last_error.unwrap().contains("verification failed"));
    assert!(h.source.settlements().is_empty());
}

#[tokio::test]
async fn test_lost_claim_race_leaves_record_untouched() {
    let h = harness(FakeSource::rival_wins(), FakeDestination::with_balance(1_000_000));
    h.pipeline.process(observed(4)).await.unwrap();

    let record = stored(&h, 4).await;
    assert_eq!(record.status, RequestStatus::Received);
    assert!(record.claim_tx.is_none());
    assert!(record.last_error.is_none());
    assert_eq!(h.destination.transfer_count(), 0);
}

#[tokio::test]
async fn test_rival_active_claim_is_not_a_failure() {
    let source = FakeSource::new();
    source.seed_claim(RIVAL);
    let h = harness(source, FakeDestination::with_balance(1_000_000));
    h.pipeline.process(observed(5)).await.unwrap();

    let record = stored(&h, 5).await;
    assert_eq!(record.status, RequestStatus::Received);
    assert_eq!(h.source.claim_submissions(), 0);
}

#[tokio::test]
async fn test_underfunded_executor_keeps_status() {
    let h = harness(FakeSource::new(), FakeDestination::with_balance(10));
    let err = h.pipeline.process(observed(6)).await.unwrap_err();
    assert!(matches!(err, BridgeError::InsufficientBalance { available: 10, required: 2000 }));

    let record = stored(&h, 6).await;
    assert_eq!(record.status, RequestStatus::Received);
    assert!(record.claim_tx.is_some());
    assert!(record.destination.is_some());
    assert!(record.payout_tx.is_none());
    assert!(record.last_error.unwrap().contains("insufficient executor balance"));
}

#[tokio::test]
async fn test_reprocessor_resumes_recorded_payout_without_resending() {
    let source = FakeSource::new();
    source.seed_claim(RELAY);
    let destination = FakeDestination::with_balance(1_000_000);
    destination.seed_transfer("0xpaid", DESTINATION, PAYOUT_AMOUNT);
    let h = harness(source, destination);

    let mut record = RequestRecord::received(evm_request(7), Some("0xsource7".into()));
    record.claim_tx = Some("0xclaim".into());
    record.destination = Some(bytes32_to_hex(&DESTINATION));
    record.payout_amount = Some(PAYOUT_AMOUNT.to_string());
    record.payout_tx = Some("0xpaid".into());
    record.payout_attempts = 1;
    record.payout_submitted_at = Some(Utc::now());
    h.store.upsert_request(&record).await.unwrap();

    let sol_to_evm = pipeline_for(
        Direction::SolToEvm,
        h.store.clone(),
        FakeSource::new(),
        FakeDestination::with_balance(0),
    );
    let reprocessor = Reprocessor::new(
        h.store.clone(),
        Arc::new(PipelineSet {
            evm_to_sol: h.pipeline.clone(),
            sol_to_evm,
        }),
        None,
        4,
    );
    let summary = reprocessor.run_once().await.unwrap();
    assert_eq!(summary.requests, 1);
    assert_eq!(summary.errors, 0);

    let record = stored(&h, 7).await;
    assert_eq!(record.status, RequestStatus::Settled);
    assert_eq!(record.payout_tx.as_deref(), Some("0xpaid"));
    assert_eq!(h.destination.transfer_count(), 0);
    assert_eq!(h.source.claim_submissions(), 0);

    // Nothing left open
    assert_eq!(reprocessor.run_once().await.unwrap().requests, 0);
}

#[tokio::test]
async fn test_terminal_records_are_never_reopened() {
    let h = harness(FakeSource::new(), FakeDestination::with_balance(1_000_000));
    let mut record = RequestRecord::received(evm_request(8), None);
    record.status = RequestStatus::Failed;
    record.last_error = Some("claim expired at 1".into());
    h.store.upsert_request(&record).await.unwrap();

    h.pipeline.process(observed(8)).await.unwrap();
    let record = stored(&h, 8).await;
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(h.source.claim_submissions(), 0);
}

/// A record that has paid out and verified its evidence but is not settled
async fn seed_verified(h: &Harness, id: u64, settlement_tx: Option<&str>) -> RequestRecord {
    let mut record = RequestRecord::received(evm_request(id), Some(format!("0xsource{}", id)));
    record.status = RequestStatus::Verified;
    record.claim_tx = Some("0xclaim".into());
    record.destination = Some(bytes32_to_hex(&DESTINATION));
    record.payout_amount = Some(PAYOUT_AMOUNT.to_string());
    record.payout_tx = Some("0xpaid".into());
    record.payout_attempts = 1;
    record.payout_confirmed = true;
    record.evidence_hash = Some(bytes32_to_hex(&[0x07; 32]));
    record.settlement_tx = settlement_tx.map(str::to_string);
    h.store.upsert_request(&record).await.unwrap();
    record
}

#[tokio::test]
async fn test_replay_after_source_finalized_settles_without_resending() {
    let source = FakeSource::new();
    source.seed_claim(RELAY);
    source.finalize();
    let h = harness(source, FakeDestination::with_balance(1_000_000));
    let record = seed_verified(&h, 12, None).await;

    h.pipeline.resume(record).await.unwrap();

    let record = stored(&h, 12).await;
    assert_eq!(record.status, RequestStatus::Settled);
    assert_eq!(record.settlement_tx.as_deref(), Some(FINALIZED_MARKER));
    assert!(h.source.settlements().is_empty());
    assert_eq!(h.destination.transfer_count(), 0);
}

#[tokio::test]
async fn test_settlement_landing_behind_transient_error_is_settled() {
    let source = FakeSource::new();
    source.lose_settlement_replies(1);
    let h = harness(source, FakeDestination::with_balance(1_000_000));

    h.pipeline.process(observed(13)).await.unwrap();

    let record = stored(&h, 13).await;
    assert_eq!(record.status, RequestStatus::Settled);
    assert_eq!(record.settlement_tx.as_deref(), Some(FINALIZED_MARKER));
    assert!(record.last_error.is_none());
    assert_eq!(h.source.settlements().len(), 1);
}

#[tokio::test]
async fn test_recorded_settlement_is_confirmed_not_resent() {
    let source = FakeSource::new();
    source.seed_claim(RELAY);
    let h = harness(source, FakeDestination::with_balance(1_000_000));
    let record = seed_verified(&h, 14, Some("0xsettle-earlier")).await;

    h.pipeline.resume(record).await.unwrap();

    let record = stored(&h, 14).await;
    assert_eq!(record.status, RequestStatus::Settled);
    assert_eq!(record.settlement_tx.as_deref(), Some("0xsettle-earlier"));
    assert!(h.source.settlements().is_empty());
}

#[tokio::test]
async fn test_unconfirmed_settlement_is_recorded_and_keeps_status() {
    let source = FakeSource::new();
    source.seed_claim(RELAY);
    source.hold_settlement_receipts();
    let h = harness(source, FakeDestination::with_balance(1_000_000));
    let record = seed_verified(&h, 15, None).await;

    let err = h.pipeline.resume(record).await.unwrap_err();
    assert!(matches!(err, BridgeError::SubmissionFailed(_)));

    let record = stored(&h, 15).await;
    assert_eq!(record.status, RequestStatus::Verified);
    assert_eq!(record.settlement_tx.as_deref(), Some("0xsettle"));
    assert!(record.last_error.unwrap().contains("unconfirmed"));
    assert_eq!(h.source.settlements().len(), 1);
}

// ---------------------------------------------------------------------------
// Verification API path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_external_evidence_settles_request() {
    let source = FakeSource::new();
    source.seed_claim(RELAY);
    let destination = FakeDestination::with_balance(0);
    destination.seed_transfer("ext-sig", DESTINATION, PAYOUT_AMOUNT);
    let h = harness(source, destination);
    h.store
        .upsert_request(&RequestRecord::received(evm_request(9), None))
        .await
        .unwrap();

    let pipelines = PipelineSet {
        evm_to_sol: h.pipeline.clone(),
        sol_to_evm: pipeline_for(
            Direction::SolToEvm,
            h.store.clone(),
            FakeSource::new(),
            FakeDestination::with_balance(0),
        ),
    };
    let record = pipelines
        .verify_and_settle(
            Direction::EvmToSol,
            ExternalDelivery {
                request_id: RequestId::from_u64(9),
                dest_tx: "ext-sig".into(),
                recipient: Pubkey::new_from_array(DESTINATION).to_string(),
                amount: Some(PAYOUT_AMOUNT),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.status, RequestStatus::Settled);
    assert_eq!(stored(&h, 9).await.settlement_tx.as_deref(), Some("0xsettle"));

    // A second submission finds the request closed
    let err = pipelines
        .verify_and_settle(
            Direction::EvmToSol,
            ExternalDelivery {
                request_id: RequestId::from_u64(9),
                dest_tx: "ext-sig".into(),
                recipient: Pubkey::new_from_array(DESTINATION).to_string(),
                amount: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyFinalized(_)));
}

#[tokio::test]
async fn test_external_evidence_amount_mismatch_is_validation() {
    let h = harness(FakeSource::new(), FakeDestination::with_balance(0));
    h.store
        .upsert_request(&RequestRecord::received(evm_request(10), None))
        .await
        .unwrap();

    let err = h
        .pipeline
        .verify_external(ExternalDelivery {
            request_id: RequestId::from_u64(10),
            dest_tx: "ext".into(),
            recipient: Pubkey::new_from_array(DESTINATION).to_string(),
            amount: Some(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Validation(_)));
    assert_eq!(stored(&h, 10).await.status, RequestStatus::Received);

    let err = h
        .pipeline
        .verify_external(ExternalDelivery {
            request_id: RequestId::from_u64(11),
            dest_tx: "ext".into(),
            recipient: Pubkey::new_from_array(DESTINATION).to_string(),
            amount: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::RequestNotFound(_)));
}

// ---------------------------------------------------------------------------
// Message pipeline
// ---------------------------------------------------------------------------

fn message(expiry: u64) -> CanonicalMessage {
    CanonicalMessage {
        version: 1,
        dir: Direction::SolToEvm,
        src_chain_id: 900,
        dst_chain_id: 31337,
        src_tx_id: [0x04; 32],
        origin_token: [0u8; 32],
        // 5 SOL in lamports
        amount: 5_000_000_000,
        recipient: [0x06; 32],
        nonce: 1,
        expiry,
    }
}

fn message_processor(store: Arc<MemoryStore>, evm: Arc<FakeDestination>) -> MessageProcessor {
    let attestor: Arc<dyn AttestationProvider> =
        Arc::new(LocalKeyAttestor::new(&format!("0x{}", "01".repeat(32))).unwrap());
    MessageProcessor::new(
        store,
        attestor,
        evm,
        FakeDestination::with_balance(0),
        Arc::new(TokenMappingTable::default()),
        policy(),
        retry(),
    )
}

fn observed_message(msg: CanonicalMessage) -> ObservedMessage {
    ObservedMessage {
        msg_id: msg.msg_id(),
        message: msg,
        source_tx: "sig".into(),
    }
}

#[tokio::test]
async fn test_message_attested_delivered_and_confirmed_once() {
    let store = Arc::new(MemoryStore::new());
    let evm = FakeDestination::with_balance(0);
    let processor = message_processor(store.clone(), evm.clone());
    let msg = message(0);
    let id = msg.msg_id();

    processor.process(observed_message(msg.clone())).await.unwrap();
    let record = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(record.status, MsgStatus::Confirmed);
    assert!(record.attestation.is_some());
    assert_eq!(record.delivery_tx.as_deref(), Some("0xdelivery1"));

    // SOL 9 decimals widen to 18 on EVM
    assert_eq!(evm.state.lock().unwrap().deliveries[0].1, 5_000_000_000_000_000_000);

    processor.process(observed_message(msg)).await.unwrap();
    assert_eq!(evm.delivery_count(), 1);
}

#[tokio::test]
async fn test_tampered_message_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    let evm = FakeDestination::with_balance(0);
    let processor = message_processor(store.clone(), evm.clone());
    let msg = message(0);
    let bogus = ObservedMessage {
        msg_id: [0xff; 32],
        message: msg,
        source_tx: "sig".into(),
    };

    let err = processor.process(bogus).await.unwrap_err();
    assert!(matches!(err, BridgeError::Tamper { .. }));
    assert!(store.get_message(&[0xff; 32]).await.unwrap().is_none());
    assert_eq!(evm.delivery_count(), 0);
}

#[tokio::test]
async fn test_expired_message_fails_without_attestation() {
    let store = Arc::new(MemoryStore::new());
    let evm = FakeDestination::with_balance(0);
    let processor = message_processor(store.clone(), evm.clone());
    let msg = message(1);
    let id = msg.msg_id();

    assert!(processor.process(observed_message(msg)).await.is_err());
    let record = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(record.status, MsgStatus::Failed);
    assert!(record.attestation.is_none());
    assert_eq!(evm.delivery_count(), 0);
}

#[tokio::test]
async fn test_reprocessor_redelivers_attested_message() {
    let store = Arc::new(MemoryStore::new());
    let evm = FakeDestination::with_balance(0);
    let processor = Arc::new(message_processor(store.clone(), evm.clone()));
    let msg = message(0);
    let id = msg.msg_id();

    let mut record = MsgRecord::observed(id, msg, Some("sig".into()));
    record.status = MsgStatus::Attested;
    record.attestation = Some(Attestation {
        v: 27,
        r: [1u8; 32],
        s: [2u8; 32],
    });
    store.upsert_message(&record).await.unwrap();

    let pipelines = Arc::new(PipelineSet {
        evm_to_sol: pipeline_for(
            Direction::EvmToSol,
            store.clone(),
            FakeSource::new(),
            FakeDestination::with_balance(0),
        ),
        sol_to_evm: pipeline_for(
            Direction::SolToEvm,
            store.clone(),
            FakeSource::new(),
            FakeDestination::with_balance(0),
        ),
    });
    let summary = Reprocessor::new(store.clone(), pipelines, Some(processor), 2)
        .run_once()
        .await
        .unwrap();
    assert_eq!(summary.messages, 1);

    let record = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(record.status, MsgStatus::Confirmed);
    // The stored signature is reused, not re-produced
    assert_eq!(record.attestation.unwrap().r, [1u8; 32]);
    assert_eq!(evm.delivery_count(), 1);
}
