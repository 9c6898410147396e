//! Digest signing for attested messages
//!
//! The network attestation service is the primary signer. The local key is
//! used only when that service is unset or unreachable, and every such use is
//! logged with `attestation_path = "local_fallback"` and counted.

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::hash::{bytes32_to_hex, parse_bytes32};
use crate::metrics;

/// secp256k1 signature over a 32-byte digest, `v` in {27, 28}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub v: u8,
    #[serde(with = "crate::hash::serde_hex32")]
    pub r: [u8; 32],
    #[serde(with = "crate::hash::serde_hex32")]
    pub s: [u8; 32],
}

impl Attestation {
    /// 65-byte `r || s || v` encoding
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }
}

pub fn normalize_v(v: u8) -> Result<u8, BridgeError> {
    match v {
        0 | 1 => Ok(v + 27),
        27 | 28 => Ok(v),
        other => Err(BridgeError::Validation(format!(
            "invalid signature recovery id {}",
            other
        ))),
    }
}

#[async_trait]
pub trait AttestationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<Attestation, BridgeError>;
}

pub struct LocalKeyAttestor {
    signer: PrivateKeySigner,
}

impl LocalKeyAttestor {
    pub fn new(private_key: &str) -> EyreResult<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .wrap_err("Invalid attestation private key")?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> String {
        format!("{}", self.signer.address())
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Attestation, BridgeError> {
        let signature = self
            .signer
            .sign_hash_sync(&B256::from(*digest))
            .map_err(|e| BridgeError::SubmissionFailed(format!("local signing failed: {}", e)))?;
        let bytes = signature.as_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Attestation {
            v: normalize_v(bytes[64])?,
            r,
            s,
        })
    }
}

#[async_trait]
impl AttestationProvider for LocalKeyAttestor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<Attestation, BridgeError> {
        self.sign(digest)
    }
}

#[derive(Serialize)]
struct AttestRequest {
    digest: String,
}

#[derive(Deserialize)]
struct AttestResponse {
    v: u8,
    r: String,
    s: String,
}

/// Client for the confidential-compute network's attestation service
pub struct NetworkAttestor {
    client: Client,
    url: String,
}

impl NetworkAttestor {
    pub fn new(base_url: &str) -> EyreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("Failed to build attestation HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/attest", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AttestationProvider for NetworkAttestor {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<Attestation, BridgeError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AttestRequest {
                digest: bytes32_to_hex(digest),
            })
            .send()
            .await
            .map_err(|e| BridgeError::Rpc(format!("attestation service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(BridgeError::Rpc(format!(
                "attestation service returned {}",
                response.status()
            )));
        }

        let body: AttestResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Validation(format!("invalid attestation response: {}", e)))?;
        Ok(Attestation {
            v: normalize_v(body.v)?,
            r: parse_bytes32(&body.r)?,
            s: parse_bytes32(&body.s)?,
        })
    }
}

/// Network attestation with a logged, counted local-key fallback
pub struct FallbackAttestor {
    primary: Option<Box<dyn AttestationProvider>>,
    local: LocalKeyAttestor,
}

impl FallbackAttestor {
    pub fn new(primary: Option<Box<dyn AttestationProvider>>, local: LocalKeyAttestor) -> Self {
        Self { primary, local }
    }
}

#[async_trait]
impl AttestationProvider for FallbackAttestor {
    fn name(&self) -> &'static str {
        match self.primary {
            Some(ref p) => p.name(),
            None => self.local.name(),
        }
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<Attestation, BridgeError> {
        let reason = match self.primary {
            Some(ref primary) => match primary.sign_digest(digest).await {
                Ok(attestation) => {
                    debug!(digest = %bytes32_to_hex(digest), attestation_path = "network", "Digest attested");
                    return Ok(attestation);
                }
                Err(e) => {
                    warn!(
                        digest = %bytes32_to_hex(digest),
                        attestation_path = "local_fallback",
                        error = %e,
                        "Network attestation failed, signing with local key"
                    );
                    "unreachable"
                }
            },
            None => {
                warn!(
                    digest = %bytes32_to_hex(digest),
                    attestation_path = "local_fallback",
                    "Network attestation not configured, signing with local key"
                );
                "unconfigured"
            }
        };
        metrics::record_attestation_fallback(reason);
        self.local.sign_digest(digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    // Anvil account #0
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_normalize_v() {
        assert_eq!(normalize_v(0).unwrap(), 27);
        assert_eq!(normalize_v(1).unwrap(), 28);
        assert_eq!(normalize_v(28).unwrap(), 28);
        assert!(normalize_v(35).is_err());
    }

    #[tokio::test]
    async fn test_local_signature_is_deterministic() {
        let attestor = LocalKeyAttestor::new(TEST_KEY).unwrap();
        assert_eq!(
            attestor.address().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        let a = attestor.sign_digest(&[7u8; 32]).await.unwrap();
        let b = attestor.sign_digest(&[7u8; 32]).await.unwrap();
        assert_eq!(a, b);
        assert!(a.v == 27 || a.v == 28);
        assert_ne!(a.r, [0u8; 32]);
        assert_ne!(attestor.sign_digest(&[8u8; 32]).await.unwrap(), a);
    }

    struct Unreachable;

    #[async_trait]
    impl AttestationProvider for Unreachable {
        fn name(&self) -> &'static str {
            "network"
        }

        async fn sign_digest(&self, _digest: &[u8; 32]) -> Result<Attestation, BridgeError> {
            Err(BridgeError::Rpc("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_fallback_uses_local_key() {
        let local = LocalKeyAttestor::new(TEST_KEY).unwrap();
        let expected = local.sign_digest(&[1u8; 32]).await.unwrap();
        let attestor = FallbackAttestor::new(Some(Box::new(Unreachable)), local);
        assert_eq!(attestor.sign_digest(&[1u8; 32]).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_network_attestor_round_trip() {
        let app = Router::new().route(
            "/attest",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert!(body["digest"].as_str().unwrap().starts_with("0x"));
                Json(serde_json::json!({
                    "v": 1,
                    "r": format!("0x{}", "11".repeat(32)),
                    "s": format!("0x{}", "22".repeat(32)),
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let attestor = NetworkAttestor::new(&format!("http://{}/", addr)).unwrap();
        let attestation = attestor.sign_digest(&[3u8; 32]).await.unwrap();
        assert_eq!(attestation.v, 28);
        assert_eq!(attestation.r, [0x11; 32]);
        assert_eq!(attestation.s, [0x22; 32]);
    }
}
