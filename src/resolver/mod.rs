//! Confidential destination resolution

use async_trait::async_trait;

use crate::contracts::solana_program::ComputationStatus;
use crate::error::BridgeError;
use crate::types::{Direction, ResolvedDestination};

pub mod confidential;
pub mod fallback;

pub use confidential::ConfidentialDestinationResolver;
pub use fallback::TestingFallbackResolver;

#[async_trait]
pub trait DestinationResolver: Send + Sync {
    /// Plaintext destination on the other chain for a request
    async fn resolve(
        &self,
        request_id: u64,
        owner: &[u8; 32],
        direction: Direction,
        min_bond: u64,
    ) -> Result<ResolvedDestination, BridgeError>;
}

/// On-chain surface of the confidential-compute network
#[async_trait]
pub trait ComputationNetwork: Send + Sync {
    /// Submit the claim + reseal instruction carrying our X25519 key
    async fn submit_reseal(
        &self,
        request_id: u64,
        owner: &[u8; 32],
        offset: u64,
        reseal_pubkey: &[u8; 32],
        bond: u64,
    ) -> Result<String, BridgeError>;

    /// `None` until the computation account exists
    async fn computation_status(&self, offset: u64) -> Result<Option<ComputationStatus>, BridgeError>;

    /// Resealed-output account payload (discriminator stripped)
    async fn fetch_resealed(&self, request_id: u64, owner: &[u8; 32]) -> Result<Vec<u8>, BridgeError>;
}
