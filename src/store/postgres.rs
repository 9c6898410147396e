//! Postgres-backed `StateStore`
//!
//! Amounts are stored as NUMERIC(78,0). Inserts cast bound text with
//! `$n::NUMERIC`; reads cast back with `::TEXT`. The forward-only rule lives
//! in the `ON CONFLICT ... WHERE` clause so concurrent writers cannot regress
//! a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, error};

use super::{MsgRecord, RequestRecord, StateStore, UpsertOutcome};
use crate::error::BridgeError;
use crate::hash::{bytes32_to_hex, parse_bytes32};
use crate::types::{BridgeRequest, Direction, MsgStatus, RequestId, RequestStatus};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const REQUEST_COLUMNS: &str = r#"request_id, sender, source_token, amount::TEXT AS amount,
    destination_handle, request_created_at, finalized, fee::TEXT AS fee, status,
    source_tx, claim_tx, destination, payout_amount::TEXT AS payout_amount, payout_tx,
    payout_submitted_at, payout_attempts, payout_confirmed, evidence_hash, settlement_tx,
    last_error, created_at, updated_at"#;

const MESSAGE_COLUMNS: &str = r#"msg_id, message, status, source_tx, attestation,
    delivery_tx, delivery_submitted_at, last_error, created_at, updated_at"#;

#[derive(Debug, FromRow)]
struct RequestRow {
    request_id: String,
    sender: String,
    source_token: String,
    amount: String,
    destination_handle: String,
    request_created_at: i64,
    finalized: bool,
    fee: String,
    status: String,
    source_tx: Option<String>,
    claim_tx: Option<String>,
    destination: Option<String>,
    payout_amount: Option<String>,
    payout_tx: Option<String>,
    payout_submitted_at: Option<DateTime<Utc>>,
    payout_attempts: i32,
    payout_confirmed: bool,
    evidence_hash: Option<String>,
    settlement_tx: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn store_err<E: std::fmt::Display>(e: E) -> BridgeError {
    BridgeError::Store(e.to_string())
}

fn parse_amount(column: &str, raw: &str) -> Result<u128, BridgeError> {
    raw.parse::<u128>()
        .map_err(|e| BridgeError::Store(format!("invalid {} '{}': {}", column, raw, e)))
}

impl RequestRow {
    fn into_record(self, direction: Direction) -> Result<RequestRecord, BridgeError> {
        let request_id: RequestId = self
            .request_id
            .parse()
            .map_err(store_err::<BridgeError>)?;
        Ok(RequestRecord {
            request: BridgeRequest {
                request_id,
                direction,
                sender: self.sender,
                source_token: self.source_token,
                amount: parse_amount("amount", &self.amount)?,
                destination_handle: parse_bytes32(&self.destination_handle)
                    .map_err(store_err)?,
                created_at: self.request_created_at,
                finalized: self.finalized,
                fee: parse_amount("fee", &self.fee)?,
            },
            status: self
                .status
                .parse()
                .map_err(store_err::<BridgeError>)?,
            source_tx: self.source_tx,
            claim_tx: self.claim_tx,
            destination: self.destination,
            payout_amount: self.payout_amount,
            payout_tx: self.payout_tx,
            payout_submitted_at: self.payout_submitted_at,
            payout_attempts: self.payout_attempts,
            payout_confirmed: self.payout_confirmed,
            evidence_hash: self.evidence_hash,
            settlement_tx: self.settlement_tx,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    msg_id: String,
    message: String,
    status: String,
    source_tx: Option<String>,
    attestation: Option<String>,
    delivery_tx: Option<String>,
    delivery_submitted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for MsgRecord {
    type Error = BridgeError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(MsgRecord {
            msg_id: parse_bytes32(&row.msg_id).map_err(store_err)?,
            message: serde_json::from_str(&row.message).map_err(store_err)?,
            status: row
                .status
                .parse()
                .map_err(store_err::<BridgeError>)?,
            source_tx: row.source_tx,
            attestation: row
                .attestation
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(store_err)?,
            delivery_tx: row.delivery_tx,
            delivery_submitted_at: row.delivery_submitted_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn get_request(
        &self,
        direction: Direction,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, BridgeError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE request_id = $1",
            REQUEST_COLUMNS,
            direction.table()
        );
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_record(direction)).transpose()
    }

    async fn upsert_request(&self, record: &RequestRecord) -> Result<UpsertOutcome, BridgeError> {
        let sql = format!(
            r#"
            INSERT INTO {table} AS t (request_id, sender, source_token, amount, destination_handle,
                request_created_at, finalized, fee, status, status_rank, source_tx, claim_tx,
                destination, payout_amount, payout_tx, payout_submitted_at, payout_attempts,
                payout_confirmed, evidence_hash, settlement_tx, last_error)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8::NUMERIC, $9, $10, $11, $12,
                $13, $14::NUMERIC, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (request_id) DO UPDATE SET
                status = EXCLUDED.status,
                status_rank = EXCLUDED.status_rank,
                finalized = EXCLUDED.finalized OR t.finalized,
                source_tx = COALESCE(EXCLUDED.source_tx, t.source_tx),
                claim_tx = COALESCE(EXCLUDED.claim_tx, t.claim_tx),
                destination = COALESCE(EXCLUDED.destination, t.destination),
                payout_amount = COALESCE(EXCLUDED.payout_amount, t.payout_amount),
                payout_tx = COALESCE(EXCLUDED.payout_tx, t.payout_tx),
                payout_submitted_at = COALESCE(EXCLUDED.payout_submitted_at, t.payout_submitted_at),
                payout_attempts = GREATEST(EXCLUDED.payout_attempts, t.payout_attempts),
                payout_confirmed = EXCLUDED.payout_confirmed OR t.payout_confirmed,
                evidence_hash = COALESCE(EXCLUDED.evidence_hash, t.evidence_hash),
                settlement_tx = COALESCE(EXCLUDED.settlement_tx, t.settlement_tx),
                last_error = COALESCE(EXCLUDED.last_error, t.last_error),
                updated_at = NOW()
            WHERE t.status NOT IN ($22, $23)
              AND (EXCLUDED.status = $23 OR EXCLUDED.status_rank >= t.status_rank)
            "#,
            table = record.direction().table()
        );
        let request = &record.request;
        let result = sqlx::query(&sql)
            .bind(request.request_id.to_string())
            .bind(&request.sender)
            .bind(&request.source_token)
            .bind(request.amount.to_string())
            .bind(bytes32_to_hex(&request.destination_handle))
            .bind(request.created_at)
            .bind(request.finalized)
            .bind(request.fee.to_string())
            .bind(record.status.as_str())
            .bind(record.status.rank())
            .bind(&record.source_tx)
            .bind(&record.claim_tx)
            .bind(&record.destination)
            .bind(&record.payout_amount)
            .bind(&record.payout_tx)
            .bind(record.payout_submitted_at)
            .bind(record.payout_attempts)
            .bind(record.payout_confirmed)
            .bind(&record.evidence_hash)
            .bind(&record.settlement_tx)
            .bind(&record.last_error)
            .bind(RequestStatus::Settled.as_str())
            .bind(RequestStatus::Failed.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(request_id = %request.request_id, error = ?e, "SQL error upserting request");
                e
            })?;

        if result.rows_affected() == 0 {
            debug!(
                request_id = %request.request_id,
                status = record.status.as_str(),
                "Stale request write ignored"
            );
            return Ok(UpsertOutcome::Stale);
        }
        Ok(UpsertOutcome::Applied)
    }

    async fn find_requests_by_status(
        &self,
        direction: Direction,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>, BridgeError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = ANY($1) ORDER BY created_at ASC",
            REQUEST_COLUMNS,
            direction.table()
        );
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_record(direction)).collect()
    }

    async fn get_message(&self, msg_id: &[u8; 32]) -> Result<Option<MsgRecord>, BridgeError> {
        let sql = format!("SELECT {} FROM bridge_messages WHERE msg_id = $1", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(bytes32_to_hex(msg_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(MsgRecord::try_from).transpose()
    }

    async fn upsert_message(&self, record: &MsgRecord) -> Result<UpsertOutcome, BridgeError> {
        let message = serde_json::to_string(&record.message)
            .map_err(store_err)?;
        let attestation = record
            .attestation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(store_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO bridge_messages AS t (msg_id, message, status, status_rank, source_tx,
                attestation, delivery_tx, delivery_submitted_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (msg_id) DO UPDATE SET
                status = EXCLUDED.status,
                status_rank = EXCLUDED.status_rank,
                source_tx = COALESCE(EXCLUDED.source_tx, t.source_tx),
                attestation = COALESCE(EXCLUDED.attestation, t.attestation),
                delivery_tx = COALESCE(EXCLUDED.delivery_tx, t.delivery_tx),
                delivery_submitted_at = COALESCE(EXCLUDED.delivery_submitted_at, t.delivery_submitted_at),
                last_error = COALESCE(EXCLUDED.last_error, t.last_error),
                updated_at = NOW()
            WHERE t.status NOT IN ($10, $11)
              AND (EXCLUDED.status = $11 OR EXCLUDED.status_rank >= t.status_rank)
            "#,
        )
        .bind(bytes32_to_hex(&record.msg_id))
        .bind(message)
        .bind(record.status.as_str())
        .bind(record.status.rank())
        .bind(&record.source_tx)
        .bind(attestation)
        .bind(&record.delivery_tx)
        .bind(record.delivery_submitted_at)
        .bind(&record.last_error)
        .bind(MsgStatus::Confirmed.as_str())
        .bind(MsgStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(UpsertOutcome::Stale);
        }
        Ok(UpsertOutcome::Applied)
    }

    async fn find_messages_by_status(
        &self,
        statuses: &[MsgStatus],
    ) -> Result<Vec<MsgRecord>, BridgeError> {
        let sql = format!(
            "SELECT {} FROM bridge_messages WHERE status = ANY($1) ORDER BY created_at ASC",
            MESSAGE_COLUMNS
        );
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MsgRecord::try_from).collect()
    }
}
