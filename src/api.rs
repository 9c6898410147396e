//! HTTP API
//!
//! - `POST /api/verify-bridge/{direction}` - verify submitted delivery evidence and settle
//! - `GET /api/bridge-status/{direction}/{id}` - persisted request row
//! - `GET /api/message-status/{msgId}` - persisted message row
//! - `GET /health` - liveness
//! - `GET /metrics` - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::hash::parse_bytes32;
use crate::metrics;
use crate::processor::{ExternalDelivery, VerificationService};
use crate::store::StateStore;
use crate::types::{Direction, RequestId};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub verification: Arc<dyn VerificationService>,
}

/// Body of `POST /api/verify-bridge/{direction}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBridgeRequest {
    /// 0x word (EVM source) or decimal id (Solana source)
    pub request_id: String,
    /// Payout transaction hash or signature on the destination chain
    pub dest_tx_hash: String,
    /// Recipient as rendered on the destination chain
    pub recipient: String,
    /// Destination base units, decimal string
    #[serde(default)]
    pub amount: Option<String>,
}

impl VerifyBridgeRequest {
    fn into_delivery(self) -> Result<ExternalDelivery, BridgeError> {
        let request_id: RequestId = self.request_id.parse()?;
        if self.dest_tx_hash.trim().is_empty() {
            return Err(BridgeError::Validation("destTxHash is required".to_string()));
        }
        let amount = self
            .amount
            .map(|raw| {
                raw.parse::<u128>()
                    .map_err(|_| BridgeError::Validation(format!("invalid amount: {}", raw)))
            })
            .transpose()?;
        Ok(ExternalDelivery {
            request_id,
            dest_tx: self.dest_tx_hash.trim().to_string(),
            recipient: self.recipient.trim().to_string(),
            amount,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// HTTP status for a pipeline error
pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BridgeError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::CONFLICT,
    }
}

struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn not_found(what: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("{} not found", what),
            kind: "not_found".to_string(),
        }),
    )
        .into_response()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn prometheus_metrics() -> Response {
    let (content_type, buffer) = match metrics::encode() {
        Ok(encoded) => encoded,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn verify_bridge(
    State(state): State<AppState>,
    Path(direction): Path<String>,
    Json(body): Json<VerifyBridgeRequest>,
) -> Result<Response, ApiError> {
    let direction: Direction = direction.parse()?;
    let delivery = body.into_delivery()?;
    info!(
        request_id = %delivery.request_id,
        direction = %direction,
        dest_tx = %delivery.dest_tx,
        "Verification requested"
    );
    match state.verification.verify_and_settle(direction, delivery).await {
        Ok(record) => Ok(Json(record).into_response()),
        Err(e) => {
            warn!(direction = %direction, error = %e, "Verification request rejected");
            Err(e.into())
        }
    }
}

async fn bridge_status(
    State(state): State<AppState>,
    Path((direction, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let direction: Direction = direction.parse()?;
    let id: RequestId = id.parse()?;
    match state.store.get_request(direction, &id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(not_found(format!("request {}", id))),
    }
}

async fn message_status(
    State(state): State<AppState>,
    Path(msg_id): Path<String>,
) -> Result<Response, ApiError> {
    let msg_id = parse_bytes32(&msg_id)?;
    match state.store.get_message(&msg_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(not_found(format!("message 0x{}", hex::encode(msg_id)))),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/verify-bridge/{direction}", post(verify_bridge))
        .route("/api/bridge-status/{direction}/{id}", get(bridge_status))
        .route("/api/message-status/{msg_id}", get(message_status))
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn start_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    metrics::UP.set(1.0);
    info!(%addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RequestRecord};
    use crate::types::BridgeRequest;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Rejecting;

    #[async_trait]
    impl VerificationService for Rejecting {
        async fn verify_and_settle(
            &self,
            _direction: Direction,
            delivery: ExternalDelivery,
        ) -> Result<RequestRecord, BridgeError> {
            if delivery.dest_tx == "missing" {
                return Err(BridgeError::RequestNotFound(delivery.request_id.to_string()));
            }
            Err(BridgeError::VerificationFailed { delta: 5, expected: 10 })
        }
    }

    fn request() -> BridgeRequest {
        BridgeRequest {
            request_id: RequestId::from_u64(42),
            direction: Direction::SolToEvm,
            sender: "11111111111111111111111111111111".into(),
            source_token: "11111111111111111111111111111111".into(),
            amount: 1_000,
            destination_handle: [7u8; 32],
            created_at: 1_700_000_000,
            finalized: false,
            fee: 0,
        }
    }

    async fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_request(&RequestRecord::received(request(), Some("sig".into())))
            .await
            .unwrap();
        router(AppState {
            store,
            verification: Arc::new(Rejecting),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bridge_status_found_and_missing() {
        let app = app().await;
        let found = app
            .clone()
            .oneshot(Request::get("/api/bridge-status/sol-to-evm/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let json = body_json(found).await;
        assert_eq!(json["status"], "RECEIVED");
        assert_eq!(json["sourceTx"], "sig");

        let missing = app
            .clone()
            .oneshot(Request::get("/api/bridge-status/evm-to-sol/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad = app
            .oneshot(Request::get("/api/bridge-status/sideways/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_message_status_missing() {
        let uri = format!("/api/message-status/0x{}", "ab".repeat(32));
        let response = app()
            .await
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn verify_post(body: serde_json::Value) -> Request<Body> {
        Request::post("/api/verify-bridge/sol-to-evm")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_maps_errors_to_status() {
        let app = app().await;
        let rejected = app
            .clone()
            .oneshot(verify_post(serde_json::json!({
                "requestId": "42",
                "destTxHash": "0xabc",
                "recipient": "0x1111111111111111111111111111111111111111"
            })))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(rejected).await["kind"], "verification_failed");

        let missing = app
            .clone()
            .oneshot(verify_post(serde_json::json!({
                "requestId": "42",
                "destTxHash": "missing",
                "recipient": "0x1111111111111111111111111111111111111111"
            })))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = app
            .oneshot(verify_post(serde_json::json!({
                "requestId": "not-a-number",
                "destTxHash": "0xabc",
                "recipient": "0x1111111111111111111111111111111111111111"
            })))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_transient_errors_are_unavailable() {
        assert_eq!(
            status_for(&BridgeError::Rpc("timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BridgeError::ClaimExpired { deadline: 1 }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_request_in_progress_is_conflict() {
        let status = status_for(&BridgeError::InProgress("0x01".into()));
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
