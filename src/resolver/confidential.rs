//! Claim + reseal, wait for finalization, then ECDH-decrypt the destination
//!
//! The network reseals the encrypted destination under a fresh X25519 key
//! generated per call. Finalization is waited for with a hard ceiling; a
//! timeout, a failed computation, a short account or a bad key exchange all
//! surface as `DecryptionFailed` and are not retried.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ComputationNetwork, DestinationResolver};
use crate::contracts::solana_program::ComputationStatus;
use crate::crypto::reseal::{decrypt_limbs, pack_limbs, LimbCipher, ResealKey, ResealedOutput};
use crate::error::BridgeError;
use crate::types::{Direction, ResolvedDestination};

pub struct ConfidentialDestinationResolver {
    network: Arc<dyn ComputationNetwork>,
    cipher: Arc<dyn LimbCipher>,
    network_public: [u8; 32],
    finalization_timeout: Duration,
    poll_interval: Duration,
}

impl ConfidentialDestinationResolver {
    pub fn new(
        network: Arc<dyn ComputationNetwork>,
        cipher: Arc<dyn LimbCipher>,
        network_public: [u8; 32],
        finalization_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            network,
            cipher,
            network_public,
            finalization_timeout,
            poll_interval,
        }
    }

    async fn wait_finalized(&self, offset: u64) -> Result<(), BridgeError> {
        loop {
            match self.network.computation_status(offset).await {
                Ok(Some(ComputationStatus::Finalized)) => return Ok(()),
                Ok(Some(ComputationStatus::Failed)) => {
                    return Err(BridgeError::DecryptionFailed(format!(
                        "computation {} failed",
                        offset
                    )))
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    debug!(offset, error = %e, "Computation status poll failed");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn decrypt(&self, key: &ResealKey, payload: &[u8]) -> Result<[u8; 32], BridgeError> {
        let output = ResealedOutput::parse(payload)?;
        let shared = key.shared_secret(&self.network_public)?;
        let limbs = decrypt_limbs(self.cipher.as_ref(), &shared, &output)?;
        Ok(pack_limbs(limbs))
    }
}

#[async_trait]
impl DestinationResolver for ConfidentialDestinationResolver {
    async fn resolve(
        &self,
        request_id: u64,
        owner: &[u8; 32],
        direction: Direction,
        min_bond: u64,
    ) -> Result<ResolvedDestination, BridgeError> {
        let offset: u64 = rand::random();
        let key = ResealKey::generate();

        let tx = self
            .network
            .submit_reseal(request_id, owner, offset, &key.public_bytes(), min_bond)
            .await
            .map_err(|e| {
                if e.is_transient() || e.is_claim_contention() {
                    e
                } else {
                    BridgeError::DecryptionFailed(format!("reseal submission rejected: {}", e))
                }
            })?;
        info!(request_id, offset, tx_hash = %tx, "Reseal submitted, waiting for finalization");

        match tokio::time::timeout(self.finalization_timeout, self.wait_finalized(offset)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(request_id, offset, timeout = ?self.finalization_timeout, "Finalization timed out");
                return Err(BridgeError::DecryptionFailed(format!(
                    "finalization timed out after {:?}",
                    self.finalization_timeout
                )));
            }
        }

        let payload = self.network.fetch_resealed(request_id, owner).await?;
        let raw = self.decrypt(&key, &payload)?;
        let destination = ResolvedDestination::for_direction(raw, direction);
        info!(request_id, direction = %direction, "Destination resolved");
        Ok(destination)
    }
}
