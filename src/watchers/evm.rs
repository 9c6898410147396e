use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::{DedupSender, ObservedRequest, SourceChainWatcher};
use crate::chains::EvmClient;
use crate::contracts::evm_bridge::ConfidentialBridge;
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::types::RequestId;

/// Request id and transaction hash carried by a `BridgeInitiated` log
pub fn decode_initiated(log: &Log) -> Result<(RequestId, String)> {
    let decoded = log
        .log_decode::<ConfidentialBridge::BridgeInitiated>()
        .wrap_err("Failed to decode BridgeInitiated")?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre::eyre!("Missing transaction hash"))?;
    Ok((
        RequestId(decoded.inner.data.requestId.0),
        format!("0x{:x}", tx_hash),
    ))
}

/// Websocket subscription to `BridgeInitiated` on the EVM bridge
pub struct EvmWatcher {
    ws_url: String,
    bridge_address: Address,
    client: Arc<EvmClient>,
    sender: DedupSender<ObservedRequest>,
    retry: RetryConfig,
}

impl EvmWatcher {
    pub fn new(
        ws_url: &str,
        bridge_address: &str,
        client: Arc<EvmClient>,
        sender: DedupSender<ObservedRequest>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        Ok(Self {
            ws_url: ws_url.to_string(),
            bridge_address,
            client,
            sender,
            retry,
        })
    }

    async fn handle_log(&self, log: &Log) -> Result<()> {
        let (request_id, source_tx) = match decode_initiated(log) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(tx_hash = ?log.transaction_hash, error = %e, "Dropping undecodable log");
                return Ok(());
            }
        };

        let fetched = with_retry(&self.retry, |_| self.client.fetch_request(&request_id)).await;
        let request = match fetched {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!(request_id = %request_id, tx_hash = %source_tx, "Request not found on bridge, dropping");
                return Ok(());
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Failed to load request, dropping");
                return Ok(());
            }
        };

        info!(
            request_id = %request_id,
            tx_hash = %source_tx,
            amount = %request.amount,
            token = %request.source_token,
            "New EVM bridge request"
        );
        let direction = request.direction;
        if self
            .sender
            .emit(request_id.0, ObservedRequest { request, source_tx })
            .await?
        {
            metrics::record_request_observed(direction.as_str());
        }
        Ok(())
    }
}

#[async_trait]
impl SourceChainWatcher for EvmWatcher {
    fn name(&self) -> &'static str {
        "evm"
    }

    async fn run_session(&self) -> Result<()> {
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .wrap_err("Failed to connect EVM websocket")?;
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(ConfidentialBridge::BridgeInitiated::SIGNATURE_HASH);
        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .wrap_err("Failed to subscribe to bridge logs")?;
        info!(bridge = %self.bridge_address, "Subscribed to BridgeInitiated");

        let mut stream = subscription.into_stream();
        while let Some(log) = stream.next().await {
            self.handle_log(&log).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{FixedBytes, B256, U256};

    fn initiated_log(tx_hash: Option<B256>) -> Log {
        let event = ConfidentialBridge::BridgeInitiated {
            requestId: FixedBytes::from([0xab; 32]),
            sender: Address::repeat_byte(0x01),
            token: Address::ZERO,
            amountAfterFee: U256::from(1_000u64),
        };
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x99),
                data: event.encode_log_data(),
            },
            transaction_hash: tx_hash,
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_initiated() {
        let (id, tx) = decode_initiated(&initiated_log(Some(B256::repeat_byte(0x11)))).unwrap();
        assert_eq!(id, RequestId([0xab; 32]));
        assert_eq!(tx, format!("0x{}", "11".repeat(32)));
    }

    #[test]
    fn test_decode_rejects_missing_hash_and_foreign_logs() {
        assert!(decode_initiated(&initiated_log(None)).is_err());

        let mut foreign = initiated_log(Some(B256::ZERO));
        foreign.inner.data = alloy::primitives::LogData::new_unchecked(vec![B256::ZERO], Default::default());
        assert!(decode_initiated(&foreign).is_err());
    }
}
