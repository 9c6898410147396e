//! Bonded, time-boxed competitive claims
//!
//! `ClaimBook` is the ledger-side rule set (what the bridge contract and
//! program enforce): one active claim per request, minimum bond, solver
//! allowlist, slashing on expiry. `ClaimCoordinator` is the relay side: it
//! pre-checks those rules, submits its own claim through a `ClaimLedger`, and
//! tracks the submission so a slow transaction is polled rather than resent.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bounded_cache::BoundedPendingCache;
use crate::error::BridgeError;
use crate::hash::bytes32_to_hex;
use crate::metrics;
use crate::retry::{watch_submission, WindowOutcome};
use crate::types::{unix_now, BridgeRequest, Claim, RequestId, TxStatus};

const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, Clone)]
pub struct ClaimRules {
    pub min_bond: u128,
    /// Fraction of an expired bond sent to the collector, in basis points
    pub slash_bps: u16,
    pub window_secs: u64,
    /// Empty means any solver may claim
    pub authorized: HashSet<[u8; 32]>,
}

impl ClaimRules {
    pub fn check_solver(&self, solver: &[u8; 32]) -> Result<(), BridgeError> {
        if !self.authorized.is_empty() && !self.authorized.contains(solver) {
            return Err(BridgeError::NotAuthorizedNode(bytes32_to_hex(solver)));
        }
        Ok(())
    }

    pub fn check_bond(&self, bond: u128) -> Result<(), BridgeError> {
        if bond < self.min_bond {
            return Err(BridgeError::BondTooLow {
                bond,
                minimum: self.min_bond,
            });
        }
        Ok(())
    }

    /// Split an expired bond into (slashed, refunded)
    pub fn slash_split(&self, bond: u128) -> (u128, u128) {
        let slashed = bond.saturating_mul(self.slash_bps as u128) / BPS_DENOMINATOR;
        (slashed, bond - slashed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub previous: Claim,
    pub slashed: u128,
    pub refunded: u128,
}

/// Ledger-side claim state for a set of requests
#[derive(Debug)]
pub struct ClaimBook {
    rules: ClaimRules,
    collector: [u8; 32],
    claims: HashMap<RequestId, Claim>,
    finalized: HashSet<RequestId>,
    balances: HashMap<[u8; 32], u128>,
}

impl ClaimBook {
    pub fn new(rules: ClaimRules, collector: [u8; 32]) -> Self {
        Self {
            rules,
            collector,
            claims: HashMap::new(),
            finalized: HashSet::new(),
            balances: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &ClaimRules {
        &self.rules
    }

    pub fn current(&self, id: &RequestId) -> Option<Claim> {
        self.claims.get(id).copied()
    }

    pub fn is_finalized(&self, id: &RequestId) -> bool {
        self.finalized.contains(id)
    }

    /// Value credited to an account by slashing or refunds
    pub fn balance_of(&self, account: &[u8; 32]) -> u128 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn credit(&mut self, account: [u8; 32], amount: u128) {
        if amount > 0 {
            *self.balances.entry(account).or_insert(0) += amount;
        }
    }

    pub fn try_claim(
        &mut self,
        id: RequestId,
        solver: [u8; 32],
        bond: u128,
        now: u64,
    ) -> Result<Claim, BridgeError> {
        self.rules.check_solver(&solver)?;
        self.rules.check_bond(bond)?;
        if self.finalized.contains(&id) {
            return Err(BridgeError::AlreadyFinalized(id.to_string()));
        }
        if let Some(existing) = self.claims.get(&id) {
            if existing.is_active(now) {
                return Err(BridgeError::ActiveClaim {
                    solver: bytes32_to_hex(&existing.solver),
                    deadline: existing.deadline,
                });
            }
            self.release_expired(id, now)?;
        }
        let claim = Claim {
            solver,
            bond,
            claimed_at: now,
            deadline: now + self.rules.window_secs,
        };
        self.claims.insert(id, claim);
        Ok(claim)
    }

    /// Callable by anyone once `now >= deadline`
    pub fn release_expired(&mut self, id: RequestId, now: u64) -> Result<ReleaseOutcome, BridgeError> {
        let existing = self
            .claims
            .get(&id)
            .copied()
            .ok_or_else(|| BridgeError::RequestNotFound(id.to_string()))?;
        if existing.is_active(now) {
            return Err(BridgeError::ActiveClaim {
                solver: bytes32_to_hex(&existing.solver),
                deadline: existing.deadline,
            });
        }
        let (slashed, refunded) = self.rules.slash_split(existing.bond);
        self.credit(self.collector, slashed);
        self.credit(existing.solver, refunded);
        self.claims.remove(&id);
        Ok(ReleaseOutcome {
            previous: existing,
            slashed,
            refunded,
        })
    }

    /// Finalize with the claimant's bond returned in full
    pub fn settle(&mut self, id: RequestId, solver: [u8; 32], now: u64) -> Result<Claim, BridgeError> {
        if self.finalized.contains(&id) {
            return Err(BridgeError::AlreadyFinalized(id.to_string()));
        }
        let claim = self
            .claims
            .get(&id)
            .copied()
            .ok_or_else(|| BridgeError::RequestNotFound(id.to_string()))?;
        if now >= claim.deadline {
            return Err(BridgeError::ClaimExpired {
                deadline: claim.deadline,
            });
        }
        if claim.solver != solver {
            return Err(BridgeError::NotClaimant {
                request_id: id.to_string(),
                holder: bytes32_to_hex(&claim.solver),
            });
        }
        self.credit(solver, claim.bond);
        self.claims.remove(&id);
        self.finalized.insert(id);
        Ok(claim)
    }
}

/// Source-chain surface used to claim requests
#[async_trait]
pub trait ClaimLedger: Send + Sync {
    fn chain(&self) -> &'static str;

    fn solver_identity(&self) -> [u8; 32];

    async fn current_claim(&self, request: &BridgeRequest) -> Result<Option<Claim>, BridgeError>;

    /// Submit a claim; `replaces` names a stuck earlier submission
    async fn submit_claim(
        &self,
        request: &BridgeRequest,
        bond: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError>;

    async fn claim_status(&self, tx: &str) -> Result<TxStatus, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Secured { tx: String },
    /// This relay already holds an active claim
    AlreadyOurs,
}

#[derive(Debug, Clone)]
struct PendingClaim {
    tx: String,
    replacements: u32,
}

#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    pub receipt_window: Duration,
    pub poll_interval: Duration,
    pub max_replacements: u32,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            receipt_window: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            max_replacements: 2,
        }
    }
}

pub struct ClaimCoordinator {
    ledger: Arc<dyn ClaimLedger>,
    rules: ClaimRules,
    policy: SubmissionPolicy,
    in_flight: Mutex<BoundedPendingCache<PendingClaim>>,
}

impl ClaimCoordinator {
    pub fn new(
        ledger: Arc<dyn ClaimLedger>,
        rules: ClaimRules,
        policy: SubmissionPolicy,
        in_flight_size: usize,
    ) -> Self {
        // In-flight entries must outlive every replacement window
        let ttl = policy.receipt_window.as_secs() * (policy.max_replacements as u64 + 2);
        Self {
            ledger,
            rules,
            policy,
            in_flight: Mutex::new(BoundedPendingCache::new(in_flight_size, ttl.max(60))),
        }
    }

    pub fn rules(&self) -> &ClaimRules {
        &self.rules
    }

    pub async fn current_claim(&self, request: &BridgeRequest) -> Result<Option<Claim>, BridgeError> {
        self.ledger.current_claim(request).await
    }

    pub async fn try_claim(
        &self,
        request: &BridgeRequest,
        bond: u128,
    ) -> Result<ClaimOutcome, BridgeError> {
        let me = self.ledger.solver_identity();
        self.rules.check_solver(&me)?;
        self.rules.check_bond(bond)?;
        if request.finalized {
            return Err(BridgeError::AlreadyFinalized(request.request_id.to_string()));
        }

        let now = unix_now();
        if let Some(existing) = self.ledger.current_claim(request).await? {
            if existing.is_active(now) {
                if existing.solver == me {
                    debug!(request_id = %request.request_id, "Claim already held by this relay");
                    return Ok(ClaimOutcome::AlreadyOurs);
                }
                return Err(BridgeError::ActiveClaim {
                    solver: bytes32_to_hex(&existing.solver),
                    deadline: existing.deadline,
                });
            }
            if existing.solver != [0u8; 32] {
                let (slashed, refunded) = self.rules.slash_split(existing.bond);
                info!(
                    request_id = %request.request_id,
                    previous_solver = %bytes32_to_hex(&existing.solver),
                    slashed = %slashed,
                    refunded = %refunded,
                    "Reclaiming expired claim; previous bond will be slashed"
                );
            }
        }

        let key = *request.request_id.as_bytes();
        let pending = self.in_flight.lock().await.get(&key).cloned();
        let mut pending = match pending {
            Some(p) => {
                debug!(request_id = %request.request_id, tx = %p.tx, "Resuming in-flight claim");
                p
            }
            None => {
                let tx = self.ledger.submit_claim(request, bond, None).await?;
                metrics::record_claim_submission(self.ledger.chain(), false);
                info!(
                    request_id = %request.request_id,
                    chain = self.ledger.chain(),
                    tx_hash = %tx,
                    "Claim submitted"
                );
                let p = PendingClaim { tx, replacements: 0 };
                self.in_flight.lock().await.insert(key, p.clone());
                p
            }
        };

        let result = self.await_claim(request, bond, &mut pending).await;
        self.in_flight.lock().await.remove(&key);
        result
    }

    async fn await_claim(
        &self,
        request: &BridgeRequest,
        bond: u128,
        pending: &mut PendingClaim,
    ) -> Result<ClaimOutcome, BridgeError> {
        let key = *request.request_id.as_bytes();
        loop {
            let tx = pending.tx.clone();
            let outcome = watch_submission(
                self.policy.receipt_window,
                self.policy.poll_interval,
                || self.ledger.claim_status(&tx),
            )
            .await?;

            match outcome {
                WindowOutcome::Confirmed => return self.confirm_holder(request, Some(tx)).await,
                WindowOutcome::Failed(reason) => {
                    warn!(request_id = %request.request_id, tx_hash = %tx, %reason, "Claim transaction failed");
                    return match self.confirm_holder(request, Some(tx)).await {
                        Err(BridgeError::SubmissionFailed(_)) => Err(BridgeError::SubmissionFailed(reason)),
                        other => other,
                    };
                }
                WindowOutcome::Elapsed => {
                    if pending.replacements >= self.policy.max_replacements {
                        return Err(BridgeError::SubmissionFailed(format!(
                            "claim {} unconfirmed after {} replacements",
                            tx, pending.replacements
                        )));
                    }
                    // The replaced tx may have landed between the last poll and now
                    if let Ok(outcome) = self.confirm_holder(request, None).await {
                        return Ok(outcome);
                    }
                    let replacement = self.ledger.submit_claim(request, bond, Some(&tx)).await?;
                    metrics::record_claim_submission(self.ledger.chain(), true);
                    pending.replacements += 1;
                    warn!(
                        request_id = %request.request_id,
                        replaced = %tx,
                        tx_hash = %replacement,
                        attempt = pending.replacements,
                        "Claim stuck past receipt window, submitted replacement"
                    );
                    pending.tx = replacement;
                    self.in_flight.lock().await.insert(key, pending.clone());
                }
            }
        }
    }

    /// Decide the claim outcome from the ledger's current holder
    async fn confirm_holder(
        &self,
        request: &BridgeRequest,
        tx: Option<String>,
    ) -> Result<ClaimOutcome, BridgeError> {
        let me = self.ledger.solver_identity();
        match self.ledger.current_claim(request).await? {
            Some(claim) if claim.is_active(unix_now()) && claim.solver == me => Ok(match tx {
                Some(tx) => ClaimOutcome::Secured { tx },
                None => ClaimOutcome::AlreadyOurs,
            }),
            Some(claim) if claim.is_active(unix_now()) => {
                Err(BridgeError::LostRace(bytes32_to_hex(&claim.solver)))
            }
            _ => Err(BridgeError::SubmissionFailed(format!(
                "no active claim for request {}",
                request.request_id
            ))),
        }
    }
}
