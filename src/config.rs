use eyre::{eyre, Result, WrapErr};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::claims::{ClaimRules, SubmissionPolicy};
use crate::crypto::envelope::EnvelopeKeyring;
use crate::hash::identity_to_bytes32;
use crate::retry::RetryConfig;
use crate::token_mapping::TokenMappingTable;

/// Main configuration for the relay
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub evm: EvmConfig,
    pub solana: SolanaConfig,
    pub confidential: ConfidentialConfig,
    pub claims: ClaimConfig,
    pub relayer: RelayerConfig,
    pub attestation: AttestationConfig,
    pub api: ApiConfig,
    pub token_mappings: TokenMappingTable,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// EVM configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
}

impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Solana configuration
#[derive(Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub program_id: String,
    /// Base58 secret or JSON byte array
    pub keypair: String,
    /// Chain id used in canonical messages
    pub chain_id: u64,
}

impl fmt::Debug for SolanaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolanaConfig")
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("program_id", &self.program_id)
            .field("keypair", &"<redacted>")
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl SolanaConfig {
    pub fn program_id(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.program_id).wrap_err("SOLANA_PROGRAM_ID must be a base58 public key")
    }

    pub fn keypair(&self) -> Result<Keypair> {
        parse_keypair(&self.keypair)
    }
}

/// Confidential-compute network configuration
#[derive(Debug, Clone)]
pub struct ConfidentialConfig {
    pub mpc_program_id: String,
    /// Network X25519 public key, hex
    pub network_pubkey: String,
    pub finalization_timeout_secs: u64,
    pub finalization_poll_ms: u64,
    pub testing_fallback_destination: Option<String>,
}

impl ConfidentialConfig {
    pub fn mpc_program_id(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.mpc_program_id).wrap_err("MPC_PROGRAM_ID must be a base58 public key")
    }

    pub fn network_pubkey(&self) -> Result<[u8; 32]> {
        let raw = self.network_pubkey.strip_prefix("0x").unwrap_or(&self.network_pubkey);
        let bytes = hex::decode(raw).wrap_err("MPC_NETWORK_PUBKEY must be hex")?;
        bytes
            .try_into()
            .map_err(|_| eyre!("MPC_NETWORK_PUBKEY must be 32 bytes"))
    }

    pub fn finalization_timeout(&self) -> Duration {
        Duration::from_secs(self.finalization_timeout_secs)
    }

    pub fn finalization_poll(&self) -> Duration {
        Duration::from_millis(self.finalization_poll_ms)
    }
}

/// Claim bonds and allowlist
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    pub min_bond_wei: u128,
    pub min_bond_lamports: u64,
    pub window_secs: u64,
    pub slash_bps: u16,
    pub slash_collector: String,
    /// Empty means the relay's own identities
    pub authorized_solvers: Vec<String>,
}

impl ClaimConfig {
    /// Rules for one source chain; `own` is the relay identity there
    pub fn rules(&self, min_bond: u128, own: [u8; 32]) -> Result<ClaimRules> {
        let mut authorized = std::collections::HashSet::new();
        for solver in &self.authorized_solvers {
            authorized.insert(
                identity_to_bytes32(solver)
                    .map_err(|e| eyre!("AUTHORIZED_SOLVERS entry {}: {}", solver, e))?,
            );
        }
        if authorized.is_empty() {
            authorized.insert(own);
        }
        Ok(ClaimRules {
            min_bond,
            slash_bps: self.slash_bps,
            window_secs: self.window_secs,
            authorized,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnv {
    Production,
    Test,
}

impl FromStr for RelayEnv {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(RelayEnv::Production),
            "test" => Ok(RelayEnv::Test),
            other => Err(eyre!("RELAY_ENV must be production or test, got {}", other)),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub env: RelayEnv,
    pub channel_capacity: usize,
    pub max_concurrent_requests: usize,
    pub reconnect_backoff_ms: u64,
    pub receipt_window_secs: u64,
    pub max_replacements: u32,
    pub evidence_retries: u32,
    pub evidence_retry_ms: u64,
    pub evidence_url_base: String,
    /// Zero disables periodic replay after startup
    pub reprocess_interval_secs: u64,
}

impl RelayerConfig {
    pub fn submission_policy(&self) -> SubmissionPolicy {
        SubmissionPolicy {
            receipt_window: Duration::from_secs(self.receipt_window_secs),
            max_replacements: self.max_replacements,
            ..SubmissionPolicy::default()
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::default()
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn evidence_interval(&self) -> Duration {
        Duration::from_millis(self.evidence_retry_ms)
    }

    pub fn reprocess_interval(&self) -> Option<Duration> {
        (self.reprocess_interval_secs > 0).then(|| Duration::from_secs(self.reprocess_interval_secs))
    }
}

/// Attestation and envelope keys
#[derive(Clone)]
pub struct AttestationConfig {
    pub url: Option<String>,
    pub private_key: String,
    /// `version:hex32` comma list
    pub envelope_keys: String,
}

impl fmt::Debug for AttestationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationConfig")
            .field("url", &self.url)
            .field("private_key", &"<redacted>")
            .field("envelope_keys", &"<redacted>")
            .finish()
    }
}

impl AttestationConfig {
    pub fn keyring(&self) -> Result<Option<EnvelopeKeyring>> {
        if self.envelope_keys.trim().is_empty() {
            return Ok(None);
        }
        let ring = EnvelopeKeyring::parse(&self.envelope_keys).wrap_err("Invalid ENVELOPE_KEYS")?;
        Ok(Some(ring))
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,
}

fn default_solana_chain_id() -> u64 {
    900
}

fn default_finalization_timeout() -> u64 {
    120
}

fn default_finalization_poll() -> u64 {
    1000
}

fn default_min_bond_wei() -> u128 {
    10_000_000_000_000_000
}

fn default_min_bond_lamports() -> u64 {
    10_000_000
}

fn default_claim_window() -> u64 {
    900
}

fn default_slash_bps() -> u16 {
    5000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_concurrent() -> usize {
    16
}

fn default_reconnect_backoff() -> u64 {
    3000
}

fn default_receipt_window() -> u64 {
    120
}

/// Solana blockhashes expire after ~150 slots (about 60s); a replacement is
/// only safe once the replaced transaction can no longer land
pub const MIN_RECEIPT_WINDOW_SECS: u64 = 90;

fn default_max_replacements() -> u32 {
    2
}

fn default_evidence_retries() -> u32 {
    10
}

fn default_evidence_retry_ms() -> u64 {
    2000
}

fn default_reprocess_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    9092
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| eyre!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Base58 secret key or a JSON byte array as written by `solana-keygen`
pub fn parse_keypair(raw: &str) -> Result<Keypair> {
    let raw = raw.trim();
    let bytes: Vec<u8> = if raw.starts_with('[') {
        serde_json::from_str(raw).wrap_err("SOLANA_KEYPAIR JSON must be a byte array")?
    } else {
        bs58::decode(raw)
            .into_vec()
            .wrap_err("SOLANA_KEYPAIR must be base58")?
    };
    Keypair::from_bytes(&bytes).map_err(|e| eyre!("SOLANA_KEYPAIR is not a valid keypair: {}", e))
}

fn is_evm_address(value: &str) -> bool {
    value.len() == 42 && value.starts_with("0x") && hex::decode(&value[2..]).is_ok()
}

fn is_private_key(value: &str) -> bool {
    value.len() == 66 && value.starts_with("0x") && hex::decode(&value[2..]).is_ok()
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let evm_private_key = required("EVM_PRIVATE_KEY")?;
        let evm = EvmConfig {
            rpc_url: required("EVM_RPC_URL")?,
            ws_url: required("EVM_WS_URL")?,
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            bridge_address: required("EVM_BRIDGE_ADDRESS")?,
            private_key: evm_private_key.clone(),
        };

        let solana = SolanaConfig {
            rpc_url: required("SOLANA_RPC_URL")?,
            ws_url: required("SOLANA_WS_URL")?,
            program_id: required("SOLANA_PROGRAM_ID")?,
            keypair: required("SOLANA_KEYPAIR")?,
            chain_id: parsed_or("SOLANA_CHAIN_ID", default_solana_chain_id())?,
        };

        let confidential = ConfidentialConfig {
            mpc_program_id: required("MPC_PROGRAM_ID")?,
            network_pubkey: required("MPC_NETWORK_PUBKEY")?,
            finalization_timeout_secs: parsed_or("FINALIZATION_TIMEOUT_SECS", default_finalization_timeout())?,
            finalization_poll_ms: parsed_or("FINALIZATION_POLL_MS", default_finalization_poll())?,
            testing_fallback_destination: optional("TESTING_FALLBACK_DESTINATION"),
        };

        let claims = ClaimConfig {
            min_bond_wei: parsed_or("MIN_BOND_WEI", default_min_bond_wei())?,
            min_bond_lamports: parsed_or("MIN_BOND_LAMPORTS", default_min_bond_lamports())?,
            window_secs: parsed_or("CLAIM_WINDOW_SECS", default_claim_window())?,
            slash_bps: parsed_or("SLASH_BPS", default_slash_bps())?,
            slash_collector: required("SLASH_COLLECTOR")?,
            authorized_solvers: optional("AUTHORIZED_SOLVERS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let relayer = RelayerConfig {
            env: parsed_or("RELAY_ENV", RelayEnv::Production)?,
            channel_capacity: parsed_or("CHANNEL_CAPACITY", default_channel_capacity())?,
            max_concurrent_requests: parsed_or("MAX_CONCURRENT_REQUESTS", default_max_concurrent())?,
            reconnect_backoff_ms: parsed_or("RECONNECT_BACKOFF_MS", default_reconnect_backoff())?,
            receipt_window_secs: parsed_or("RECEIPT_WINDOW_SECS", default_receipt_window())?,
            max_replacements: parsed_or("MAX_REPLACEMENTS", default_max_replacements())?,
            evidence_retries: parsed_or("EVIDENCE_RETRIES", default_evidence_retries())?,
            evidence_retry_ms: parsed_or("EVIDENCE_RETRY_MS", default_evidence_retry_ms())?,
            evidence_url_base: optional("EVIDENCE_URL_BASE").unwrap_or_default(),
            reprocess_interval_secs: parsed_or("REPROCESS_INTERVAL_SECS", default_reprocess_interval())?,
        };

        let attestation = AttestationConfig {
            url: optional("ATTESTATION_URL"),
            private_key: optional("ATTESTATION_PRIVATE_KEY").unwrap_or(evm_private_key),
            envelope_keys: optional("ENVELOPE_KEYS").unwrap_or_default(),
        };

        let api = ApiConfig {
            bind: optional("API_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed_or("API_PORT", default_api_port())?,
        };

        let token_mappings = match (optional("TOKEN_MAPPINGS_PATH"), optional("TOKEN_MAPPINGS")) {
            (Some(path), _) => {
                let raw = std::fs::read_to_string(&path)
                    .wrap_err_with(|| format!("Failed to read token mappings from {}", path))?;
                TokenMappingTable::from_json(&raw).map_err(|e| eyre!("{}: {}", path, e))?
            }
            (None, Some(inline)) => {
                TokenMappingTable::from_json(&inline).map_err(|e| eyre!("TOKEN_MAPPINGS: {}", e))?
            }
            (None, None) => TokenMappingTable::default(),
        };

        let config = Config {
            database,
            evm,
            solana,
            confidential,
            claims,
            relayer,
            attestation,
            api,
            token_mappings,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for (name, url) in [
            ("EVM_RPC_URL", &self.evm.rpc_url),
            ("EVM_WS_URL", &self.evm.ws_url),
            ("SOLANA_RPC_URL", &self.solana.rpc_url),
            ("SOLANA_WS_URL", &self.solana.ws_url),
        ] {
            url::Url::parse(url).wrap_err_with(|| format!("{} is not a valid URL", name))?;
        }

        if !is_evm_address(&self.evm.bridge_address) {
            return Err(eyre!(
                "evm.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if !is_private_key(&self.evm.private_key) {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }
        if !is_private_key(&self.attestation.private_key) {
            return Err(eyre!("attestation.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        self.solana.program_id()?;
        self.solana.keypair()?;
        self.confidential.mpc_program_id()?;
        self.confidential.network_pubkey()?;

        identity_to_bytes32(&self.claims.slash_collector)
            .map_err(|e| eyre!("SLASH_COLLECTOR: {}", e))?;
        if self.claims.slash_bps > 10_000 {
            return Err(eyre!("claims.slash_bps cannot exceed 10000"));
        }
        if self.claims.window_secs == 0 {
            return Err(eyre!("claims.window_secs must be positive"));
        }

        if let Some(fallback) = &self.confidential.testing_fallback_destination {
            if self.relayer.env != RelayEnv::Test {
                return Err(eyre!(
                    "TESTING_FALLBACK_DESTINATION is only allowed with RELAY_ENV=test"
                ));
            }
            identity_to_bytes32(fallback).map_err(|e| eyre!("TESTING_FALLBACK_DESTINATION: {}", e))?;
        }

        if let Some(url) = &self.attestation.url {
            url::Url::parse(url).wrap_err("ATTESTATION_URL is not a valid URL")?;
        }
        self.attestation.keyring()?;

        if self.relayer.receipt_window_secs < MIN_RECEIPT_WINDOW_SECS {
            return Err(eyre!(
                "RECEIPT_WINDOW_SECS must be at least {} (blockhash lifetime)",
                MIN_RECEIPT_WINDOW_SECS
            ));
        }

        if self.relayer.channel_capacity == 0 || self.relayer.max_concurrent_requests == 0 {
            return Err(eyre!("channel capacity and concurrency must be positive"));
        }

        Ok(())
    }
}
