//! Bounded retry for transient infrastructure failures
//!
//! Provides exponential backoff, fee bumping for replacement transactions,
//! and classification of raw RPC error text.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::BridgeError;
use crate::types::TxStatus;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fee bump percentage per replacement
    pub fee_bump_percent: u32,
    /// Maximum fee multiplier (e.g., 3 = 3x original)
    pub max_fee_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            fee_bump_percent: 20,
            max_fee_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Fixed-interval retry, used for evidence polling
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: interval,
            max_backoff: interval,
            backoff_multiplier: 1.0,
            ..Self::default()
        }
    }

    /// Backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Fee for the n-th replacement of a stuck transaction
    pub fn fee_for_attempt(&self, base_fee: u128, attempt: u32) -> u128 {
        if attempt == 0 {
            return base_fee;
        }
        let multiplier = 1.0 + (self.fee_bump_percent as f64 / 100.0) * (attempt as f64);
        let capped_multiplier = multiplier.min(self.max_fee_multiplier);
        (base_fee as f64 * capped_multiplier) as u128
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// RPC timeout, network issues
    Transient,
    /// Transaction or account not visible yet
    NotFound,
    /// Replacement fee too low
    Underpriced,
    /// Already processed (nonce too low, duplicate signature)
    AlreadyProcessed,
    /// Revert, bad signature, insufficient funds
    Permanent,
    Unknown,
}

/// Classify raw RPC error text
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("not found")
        || error_lower.contains("invalid type: null")
        || error_lower.contains("could not find")
    {
        return ErrorClass::NotFound;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("already been processed")
    {
        return ErrorClass::AlreadyProcessed;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("custom program error")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Map raw RPC error text onto the relay error taxonomy.
///
/// `context` is prefixed to the message so logs show which call failed.
pub fn rpc_error(context: &str, error: impl std::fmt::Display) -> BridgeError {
    let text = format!("{}: {}", context, error);
    match classify_error(&text) {
        ErrorClass::NotFound => BridgeError::NotYetVisible(text),
        ErrorClass::Permanent | ErrorClass::Underpriced | ErrorClass::AlreadyProcessed => {
            BridgeError::SubmissionFailed(text)
        }
        ErrorClass::Transient | ErrorClass::Unknown => BridgeError::Rpc(text),
    }
}

/// Run an operation, retrying transient failures with backoff.
///
/// Protocol errors are returned immediately. After `max_retries` the last
/// transient error is returned.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, BridgeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && config.should_retry(attempt) => {
                let backoff = config.backoff_for_attempt(attempt);
                attempt += 1;
                warn!(
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of watching a submitted transaction for a bounded window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome {
    Confirmed,
    Failed(String),
    /// No receipt inside the window; the caller may submit a replacement
    Elapsed,
}

/// Poll a transaction's status every `interval` until it resolves or
/// `window` passes. Transient polling errors count as still pending.
pub async fn watch_submission<F, Fut>(
    window: Duration,
    interval: Duration,
    mut poll: F,
) -> Result<WindowOutcome, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TxStatus, BridgeError>>,
{
    let started = tokio::time::Instant::now();
    loop {
        match poll().await {
            Ok(TxStatus::Confirmed) => return Ok(WindowOutcome::Confirmed),
            Ok(TxStatus::Failed(reason)) => return Ok(WindowOutcome::Failed(reason)),
            Ok(TxStatus::Pending) => {}
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Status poll failed, treating as pending");
            }
            Err(e) => return Err(e),
        }
        if started.elapsed() >= window {
            return Ok(WindowOutcome::Elapsed);
        }
        tokio::time::sleep(interval).await;
    }
}
