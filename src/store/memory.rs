//! In-memory `StateStore` with the same forward-only rules as Postgres

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MsgRecord, RequestRecord, StateStore, UpsertOutcome};
use crate::error::BridgeError;
use crate::types::{Direction, MsgStatus, RequestId, RequestStatus};

#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<(Direction, RequestId), RequestRecord>>,
    messages: RwLock<HashMap<[u8; 32], MsgRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_request(
        &self,
        direction: Direction,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, BridgeError> {
        Ok(self.requests.read().await.get(&(direction, *id)).cloned())
    }

    async fn upsert_request(&self, record: &RequestRecord) -> Result<UpsertOutcome, BridgeError> {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&(record.direction(), record.id())) {
            None => {
                requests.insert((record.direction(), record.id()), record.clone());
                Ok(UpsertOutcome::Applied)
            }
            Some(existing) if existing.status.accepts(record.status) => {
                existing.merge_from(record);
                Ok(UpsertOutcome::Applied)
            }
            Some(_) => Ok(UpsertOutcome::Stale),
        }
    }

    async fn find_requests_by_status(
        &self,
        direction: Direction,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>, BridgeError> {
        let mut found: Vec<RequestRecord> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.direction() == direction && statuses.contains(&r.status))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn get_message(&self, msg_id: &[u8; 32]) -> Result<Option<MsgRecord>, BridgeError> {
        Ok(self.messages.read().await.get(msg_id).cloned())
    }

    async fn upsert_message(&self, record: &MsgRecord) -> Result<UpsertOutcome, BridgeError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&record.msg_id) {
            None => {
                messages.insert(record.msg_id, record.clone());
                Ok(UpsertOutcome::Applied)
            }
            Some(existing) if existing.status.accepts(record.status) => {
                existing.merge_from(record);
                Ok(UpsertOutcome::Applied)
            }
            Some(_) => Ok(UpsertOutcome::Stale),
        }
    }

    async fn find_messages_by_status(
        &self,
        statuses: &[MsgStatus],
    ) -> Result<Vec<MsgRecord>, BridgeError> {
        let mut found: Vec<MsgRecord> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| statuses.contains(&m.status))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        Ok(found)
    }
}
