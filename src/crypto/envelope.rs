//! Envelope decryption for confidential log lines
//!
//! Lines look like `Program log: envelope:<base64>`. The decoded payload is
//! `key_version (1) || nonce (12) || AES-256-GCM ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const ENVELOPE_LOG_PREFIX: &str = "Program log: envelope:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unknown envelope key version {0}")]
    UnknownKeyVersion(u8),
    #[error("envelope payload truncated ({0} bytes)")]
    Truncated(usize),
    #[error("envelope authentication failed")]
    Authentication,
    #[error("envelope encoding invalid: {0}")]
    Encoding(String),
}

/// AES-256-GCM keys selected by the embedded key-version byte
#[derive(Clone, Default)]
pub struct EnvelopeKeyring {
    keys: BTreeMap<u8, Aes256Gcm>,
}

impl fmt::Debug for EnvelopeKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeKeyring")
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EnvelopeKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, version: u8, key: [u8; 32]) -> Self {
        self.insert(version, key);
        self
    }

    pub fn insert(&mut self, version: u8, key: [u8; 32]) {
        self.keys.insert(version, Aes256Gcm::new(&key.into()));
    }

    /// Parse `version:hexkey` pairs separated by commas
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let mut ring = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (version, key_hex) = entry
                .split_once(':')
                .ok_or_else(|| EnvelopeError::Encoding(format!("missing ':' in {}", entry)))?;
            let version: u8 = version
                .trim()
                .parse()
                .map_err(|_| EnvelopeError::Encoding(format!("bad key version {}", version)))?;
            let bytes = hex::decode(key_hex.trim().trim_start_matches("0x"))
                .map_err(|e| EnvelopeError::Encoding(e.to_string()))?;
            let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
                EnvelopeError::Encoding(format!("key must be 32 bytes, got {}", b.len()))
            })?;
            if ring.keys.contains_key(&version) {
                return Err(EnvelopeError::Encoding(format!(
                    "duplicate key version {}",
                    version
                )));
            }
            ring.insert(version, key);
        }
        Ok(ring)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if payload.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(EnvelopeError::Truncated(payload.len()));
        }
        let version = payload[0];
        let cipher = self
            .keys
            .get(&version)
            .ok_or(EnvelopeError::UnknownKeyVersion(version))?;
        let nonce = Nonce::from_slice(&payload[1..1 + NONCE_LEN]);
        cipher
            .decrypt(nonce, &payload[1 + NONCE_LEN..])
            .map_err(|_| EnvelopeError::Authentication)
    }

    pub fn seal(
        &self,
        version: u8,
        nonce: [u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EnvelopeError> {
        let cipher = self
            .keys
            .get(&version)
            .ok_or(EnvelopeError::UnknownKeyVersion(version))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::Authentication)?;
        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(version);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an envelope log line; `None` when the line is not an envelope
    pub fn open_log_line(&self, line: &str) -> Option<Result<Vec<u8>, EnvelopeError>> {
        let encoded = line.strip_prefix(ENVELOPE_LOG_PREFIX)?;
        Some(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| EnvelopeError::Encoding(e.to_string()))
                .and_then(|payload| self.open(&payload)),
        )
    }
}

/// Render a sealed payload as an envelope log line
pub fn to_log_line(payload: &[u8]) -> String {
    format!("{}{}", ENVELOPE_LOG_PREFIX, STANDARD.encode(payload))
}
