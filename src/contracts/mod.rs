pub mod evm_bridge;
pub mod solana_program;
