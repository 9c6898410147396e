//! Test-only destination substitution
//!
//! Wraps a resolver and substitutes a configured destination when
//! resolution fails with `DecryptionFailed`. Startup only builds this when
//! `RELAY_ENV=test`; production configs that set a fallback are rejected.

use async_trait::async_trait;
use tracing::warn;

use super::DestinationResolver;
use crate::error::BridgeError;
use crate::types::{Direction, ResolvedDestination};

pub struct TestingFallbackResolver<R> {
    inner: R,
    fallback: [u8; 32],
}

impl<R: DestinationResolver> TestingFallbackResolver<R> {
    pub fn new(inner: R, fallback: [u8; 32]) -> Self {
        Self { inner, fallback }
    }
}

#[async_trait]
impl<R: DestinationResolver> DestinationResolver for TestingFallbackResolver<R> {
    async fn resolve(
        &self,
        request_id: u64,
        owner: &[u8; 32],
        direction: Direction,
        min_bond: u64,
    ) -> Result<ResolvedDestination, BridgeError> {
        match self.inner.resolve(request_id, owner, direction, min_bond).await {
            Err(BridgeError::DecryptionFailed(reason)) => {
                let destination = ResolvedDestination::for_direction(self.fallback, direction);
                warn!(
                    request_id,
                    %reason,
                    destination = %destination.render(direction),
                    resolution_path = "testing_fallback",
                    "Decryption failed, substituting testing fallback destination"
                );
                Ok(destination)
            }
            other => other,
        }
    }
}
