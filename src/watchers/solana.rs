use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eyre::{Result, WrapErr};
use futures::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, warn};

use super::{DedupSender, ObservedMessage, ObservedRequest, SourceChainWatcher};
use crate::contracts::solana_program::{discriminator, BridgeInitiatedEvent};
use crate::crypto::envelope::EnvelopeKeyring;
use crate::hash::bytes32_to_hex;
use crate::message::SignedEnvelopeBody;
use crate::metrics;
use crate::types::{BridgeRequest, Direction, RequestId};

const PROGRAM_DATA_PREFIX: &str = "Program data: ";

#[derive(Debug, Clone)]
pub enum LogItem {
    Request(BridgeInitiatedEvent),
    Message(SignedEnvelopeBody),
}

/// Why a recognised line was dropped; used as the metric label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(String),
    Envelope(String),
    Tamper(String),
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::Malformed(_) => "malformed",
            DropReason::Envelope(_) => "envelope_error",
            DropReason::Tamper(_) => "tamper",
        }
    }
}

/// Decode one program log line. `None` for lines the relay does not consume.
pub fn decode_log_line(line: &str, keyring: Option<&EnvelopeKeyring>) -> Option<Result<LogItem, DropReason>> {
    if let Some(encoded) = line.strip_prefix(PROGRAM_DATA_PREFIX) {
        let data = STANDARD.decode(encoded.trim()).ok()?;
        if data.len() < 8 || data[..8] != discriminator("event", "BridgeInitiated") {
            return None;
        }
        return Some(
            BridgeInitiatedEvent::decode(&data)
                .map(LogItem::Request)
                .map_err(|e| DropReason::Malformed(e.to_string())),
        );
    }

    let opened = keyring?.open_log_line(line)?;
    Some(
        opened
            .map_err(|e| DropReason::Envelope(e.to_string()))
            .and_then(|plaintext| {
                serde_json::from_slice::<SignedEnvelopeBody>(&plaintext)
                    .map_err(|e| DropReason::Malformed(e.to_string()))
            })
            .and_then(|body| {
                body.message
                    .verify_id(&body.msg_id)
                    .map_err(|e| DropReason::Tamper(e.to_string()))?;
                Ok(LogItem::Message(body))
            }),
    )
}

pub fn request_from_event(event: &BridgeInitiatedEvent) -> BridgeRequest {
    BridgeRequest {
        request_id: RequestId::from_u64(event.request_id),
        direction: Direction::SolToEvm,
        sender: Pubkey::new_from_array(event.owner).to_string(),
        source_token: Pubkey::new_from_array(event.token_mint).to_string(),
        amount: u128::from(event.amount),
        destination_handle: event.destination_handle,
        created_at: event.created_at,
        finalized: false,
        fee: u128::from(event.fee),
    }
}

/// Log subscription on the bridge program: `BridgeInitiated` events and,
/// when a keyring is configured, envelope-encrypted canonical messages
pub struct SolanaWatcher {
    ws_url: String,
    program_id: Pubkey,
    keyring: Option<EnvelopeKeyring>,
    requests: DedupSender<ObservedRequest>,
    messages: Option<DedupSender<ObservedMessage>>,
}

impl SolanaWatcher {
    pub fn new(
        ws_url: &str,
        program_id: Pubkey,
        keyring: Option<EnvelopeKeyring>,
        requests: DedupSender<ObservedRequest>,
        messages: Option<DedupSender<ObservedMessage>>,
    ) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            program_id,
            keyring: keyring.filter(|k| !k.is_empty()),
            requests,
            messages,
        }
    }

    async fn handle_line(&self, signature: &str, line: &str) -> Result<()> {
        let Some(decoded) = decode_log_line(line, self.keyring.as_ref()) else {
            return Ok(());
        };
        match decoded {
            Ok(LogItem::Request(event)) => {
                let request = request_from_event(&event);
                info!(
                    request_id = %request.request_id,
                    tx_hash = %signature,
                    amount = %request.amount,
                    token = %request.source_token,
                    "New Solana bridge request"
                );
                let observed = ObservedRequest {
                    request,
                    source_tx: signature.to_string(),
                };
                if self.requests.emit(observed.request.request_id.0, observed).await? {
                    metrics::record_request_observed(Direction::SolToEvm.as_str());
                }
            }
            Ok(LogItem::Message(body)) => {
                let Some(messages) = &self.messages else {
                    return Ok(());
                };
                debug!(msg_id = %bytes32_to_hex(&body.msg_id), tx_hash = %signature, "Envelope message decoded");
                let observed = ObservedMessage {
                    msg_id: body.msg_id,
                    message: body.message,
                    source_tx: signature.to_string(),
                };
                if messages.emit(observed.msg_id, observed).await? {
                    metrics::record_message_observed("ok");
                }
            }
            Err(reason) => {
                warn!(tx_hash = %signature, reason = ?reason, "Dropping program log line");
                metrics::record_message_observed(reason.label());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceChainWatcher for SolanaWatcher {
    fn name(&self) -> &'static str {
        "solana"
    }

    async fn run_session(&self) -> Result<()> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .wrap_err("Failed to connect Solana pubsub")?;
        let (mut stream, unsubscribe) = client
            .logs_subscribe(
                RpcTransactionLogsFilter::Mentions(vec![self.program_id.to_string()]),
                RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                },
            )
            .await
            .wrap_err("Failed to subscribe to program logs")?;
        info!(program_id = %self.program_id, envelopes = self.keyring.is_some(), "Subscribed to program logs");

        while let Some(response) = stream.next().await {
            let logs = response.value;
            if logs.err.is_some() {
                continue;
            }
            for line in &logs.logs {
                self.handle_line(&logs.signature, line).await?;
            }
        }
        unsubscribe().await;
        Ok(())
    }
}
