//! Replay of non-terminal records
//!
//! On startup, and optionally on a fixed interval afterwards, every request
//! and message stuck short of a terminal status is handed back to its
//! pipeline, which resumes from the next missing step.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::processor::{MessageProcessor, PipelineSet};
use crate::store::StateStore;
use crate::types::{Direction, MsgStatus, RequestStatus};

const OPEN_REQUEST_STATUSES: [RequestStatus; 2] = [RequestStatus::Received, RequestStatus::Verified];
const OPEN_MESSAGE_STATUSES: [MsgStatus; 3] = [MsgStatus::Observed, MsgStatus::Attested, MsgStatus::Submitted];

/// Counts from one replay pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub requests: usize,
    pub messages: usize,
    pub errors: usize,
}

pub struct Reprocessor {
    store: Arc<dyn StateStore>,
    pipelines: Arc<PipelineSet>,
    messages: Option<Arc<MessageProcessor>>,
    concurrency: usize,
}

impl Reprocessor {
    pub fn new(
        store: Arc<dyn StateStore>,
        pipelines: Arc<PipelineSet>,
        messages: Option<Arc<MessageProcessor>>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            pipelines,
            messages,
            concurrency: concurrency.max(1),
        }
    }

    /// Resume every open record once
    pub async fn run_once(&self) -> Result<ReplaySummary, BridgeError> {
        let mut summary = ReplaySummary::default();

        for direction in [Direction::EvmToSol, Direction::SolToEvm] {
            let open = self
                .store
                .find_requests_by_status(direction, &OPEN_REQUEST_STATUSES)
                .await?;
            if open.is_empty() {
                continue;
            }
            info!(direction = %direction, count = open.len(), "Resuming open requests");
            summary.requests += open.len();

            let pipeline = self.pipelines.get(direction).clone();
            let errors = stream::iter(open)
                .map(|record| {
                    let pipeline = pipeline.clone();
                    async move {
                        let id = record.id();
                        pipeline.resume(record).await.map_err(|e| (id, e))
                    }
                })
                .buffer_unordered(self.concurrency)
                .filter_map(|result| async move { result.err() })
                .collect::<Vec<_>>()
                .await;
            for (id, e) in &errors {
                warn!(request_id = %id, direction = %direction, error = %e, "Resumed request did not complete");
            }
            summary.errors += errors.len();
        }

        if let Some(processor) = &self.messages {
            let open = self.store.find_messages_by_status(&OPEN_MESSAGE_STATUSES).await?;
            if !open.is_empty() {
                info!(count = open.len(), "Resuming open messages");
            }
            summary.messages = open.len();
            let errors = stream::iter(open)
                .map(|record| {
                    let processor = processor.clone();
                    async move { processor.resume(record).await }
                })
                .buffer_unordered(self.concurrency)
                .filter(|result| futures::future::ready(result.is_err()))
                .count()
                .await;
            summary.errors += errors;
        }

        info!(
            requests = summary.requests,
            messages = summary.messages,
            errors = summary.errors,
            "Replay pass complete"
        );
        Ok(summary)
    }

    /// Replay now, then every `interval` until shutdown
    pub async fn run(self, interval: Option<Duration>, mut shutdown: mpsc::Receiver<()>) {
        if let Err(e) = self.run_once().await {
            warn!(error = %e, "Startup replay failed");
        }
        let Some(interval) = interval else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping reprocessor");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Periodic replay failed");
                    }
                }
            }
        }
    }
}
