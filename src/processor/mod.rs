//! Request and message pipelines

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::store::RequestRecord;
use crate::types::{Direction, RequestId};

pub mod in_flight;
pub mod message;
pub mod request;

pub use in_flight::InFlightSet;
pub use message::MessageProcessor;
pub use request::{next_step, BondSettings, RequestPipeline, Step};

/// Delivery evidence submitted through the verification API
#[derive(Debug, Clone)]
pub struct ExternalDelivery {
    pub request_id: RequestId,
    /// Destination-chain transaction hash or signature
    pub dest_tx: String,
    /// Recipient as rendered on the destination chain
    pub recipient: String,
    /// Expected destination amount, checked against the planned payout
    pub amount: Option<u128>,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn verify_and_settle(
        &self,
        direction: Direction,
        delivery: ExternalDelivery,
    ) -> Result<RequestRecord, BridgeError>;
}

/// One pipeline per direction
pub struct PipelineSet {
    pub evm_to_sol: Arc<RequestPipeline>,
    pub sol_to_evm: Arc<RequestPipeline>,
}

impl PipelineSet {
    pub fn get(&self, direction: Direction) -> &Arc<RequestPipeline> {
        match direction {
            Direction::EvmToSol => &self.evm_to_sol,
            Direction::SolToEvm => &self.sol_to_evm,
        }
    }
}

#[async_trait]
impl VerificationService for PipelineSet {
    async fn verify_and_settle(
        &self,
        direction: Direction,
        delivery: ExternalDelivery,
    ) -> Result<RequestRecord, BridgeError> {
        self.get(direction).verify_external(delivery).await
    }
}
