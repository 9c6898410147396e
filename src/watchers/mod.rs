//! Source chain watchers
//!
//! Each watcher owns one long-lived subscription, decodes logs into requests
//! or messages, and hands them to a bounded per-direction channel. Nothing is
//! replayed across a reconnect; downstream processing is idempotent.

use async_trait::async_trait;
use eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bounded_cache::BoundedHashCache;
use crate::message::CanonicalMessage;
use crate::metrics;
use crate::types::BridgeRequest;

pub mod evm;
pub mod solana;

pub use evm::EvmWatcher;
pub use solana::SolanaWatcher;

/// A source-chain request as emitted by a watcher
#[derive(Debug, Clone)]
pub struct ObservedRequest {
    pub request: BridgeRequest,
    pub source_tx: String,
}

/// A decrypted, id-checked canonical message
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    pub msg_id: [u8; 32],
    pub message: CanonicalMessage,
    pub source_tx: String,
}

#[async_trait]
pub trait SourceChainWatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// One subscription session; returns when the stream ends
    async fn run_session(&self) -> Result<()>;
}

/// The consumer of a watcher's channel has gone away; the watcher stops
/// instead of reconnecting
#[derive(Debug, thiserror::Error)]
#[error("downstream channel closed")]
pub struct DownstreamClosed;

impl DownstreamClosed {
    pub fn caused(report: &eyre::Report) -> bool {
        report.chain().any(|cause| cause.is::<DownstreamClosed>())
    }
}

/// Bounded channel sender that drops ids already emitted recently
pub struct DedupSender<T> {
    tx: mpsc::Sender<T>,
    seen: Mutex<BoundedHashCache>,
}

impl<T> DedupSender<T> {
    pub fn new(tx: mpsc::Sender<T>, dedup_size: usize, ttl_secs: u64) -> Self {
        Self {
            tx,
            seen: Mutex::new(BoundedHashCache::new(dedup_size, ttl_secs)),
        }
    }

    /// Emit `item` unless `key` was seen; waits when the channel is full.
    /// Returns `Ok(false)` for a dropped duplicate.
    pub async fn emit(&self, key: [u8; 32], item: T) -> Result<bool> {
        let fresh = match self.seen.lock() {
            Ok(mut seen) => seen.check_and_insert(key),
            Err(poisoned) => poisoned.into_inner().check_and_insert(key),
        };
        if !fresh {
            debug!(key = %hex::encode(key), "Dropping duplicate delivery");
            return Ok(false);
        }
        self.tx
            .send(item)
            .await
            .map_err(|_| DownstreamClosed)?;
        Ok(true)
    }
}

/// Run `session` forever, reconnecting after a fixed backoff
pub async fn run_with_reconnect<F, Fut>(name: &'static str, backoff: Duration, mut session: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        match session().await {
            Ok(()) => warn!(watcher = name, "Subscription ended, reconnecting"),
            Err(e) if DownstreamClosed::caused(&e) => {
                info!(watcher = name, "Downstream closed, stopping watcher");
                return Ok(());
            }
            Err(e) => warn!(watcher = name, error = %e, "Subscription failed, reconnecting"),
        }
        metrics::record_watcher_reconnect(name);
        tokio::time::sleep(backoff).await;
    }
}

/// Manages every configured watcher
pub struct WatcherManager {
    watchers: Vec<Arc<dyn SourceChainWatcher>>,
    reconnect_backoff: Duration,
}

impl WatcherManager {
    pub fn new(watchers: Vec<Arc<dyn SourceChainWatcher>>, reconnect_backoff: Duration) -> Self {
        info!(
            watchers = ?watchers.iter().map(|w| w.name()).collect::<Vec<_>>(),
            "Watcher manager created"
        );
        Self {
            watchers,
            reconnect_backoff,
        }
    }

    /// Run all watchers concurrently.
    /// Returns when any watcher stops or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        for watcher in self.watchers {
            let backoff = self.reconnect_backoff;
            join_set.spawn(async move {
                let name = watcher.name();
                run_with_reconnect(name, backoff, || {
                    let watcher = watcher.clone();
                    async move { watcher.run_session().await }
                })
                .await
            });
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        info!("A watcher stopped after its consumer closed");
                        Ok(())
                    }
                    Some(Ok(Err(e))) => {
                        error!("A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        warn!("No watchers configured");
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_dedup_sender_drops_repeats() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = DedupSender::new(tx, 16, 60);
        assert!(sender.emit([1u8; 32], 1u32).await.unwrap());
        assert!(!sender.emit([1u8; 32], 2u32).await.unwrap());
        assert!(sender.emit([2u8; 32], 3u32).await.unwrap());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let sender = DedupSender::new(tx, 16, 60);
        let err = sender.emit([1u8; 32], 1).await.unwrap_err();
        assert!(DownstreamClosed::caused(&err));
    }

    #[tokio::test]
    async fn test_reconnects_until_downstream_closes() {
        let sessions = AtomicU32::new(0);
        run_with_reconnect("test", Duration::from_millis(1), || {
            let n = sessions.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Ok(()),
                    1 => Err(eyre::eyre!("socket reset")),
                    _ => Err(eyre::Report::new(DownstreamClosed).wrap_err("emitting request")),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(sessions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_text_alone_does_not_stop_watcher() {
        let sessions = AtomicU32::new(0);
        run_with_reconnect("test", Duration::from_millis(1), || {
            let n = sessions.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    // An RPC error that merely quotes the phrase is retried
                    0 => Err(eyre::eyre!("rpc: downstream channel closed by peer")),
                    _ => Err(eyre::Report::new(DownstreamClosed)),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(sessions.load(Ordering::SeqCst), 2);
    }
}
