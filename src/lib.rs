//! Veil bridge relay - library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod bounded_cache;
pub mod chains;
pub mod claims;
pub mod config;
pub mod contracts;
pub mod crypto;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod hash;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod reprocessor;
pub mod resolver;
pub mod retry;
pub mod settlement;
pub mod store;
pub mod token_mapping;
pub mod types;
pub mod watchers;
