//! Chain clients
//!
//! Each client implements every chain-facing trait the pipelines need on its
//! chain, so one signer identity backs claims, payouts and settlements.

pub mod evm;
pub mod solana;

pub use evm::EvmClient;
pub use solana::SolanaClient;
