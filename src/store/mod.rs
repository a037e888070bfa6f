//! Durable pending-call record.
//!
//! On a cold start via push wake none of the in-memory call state exists;
//! this record is the last link in the accept path's fallback chain.

pub mod traits;

use crate::types::call::{CallId, CallMediaType, ParticipantInfo, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use traits::{KeyValueStore, StoreError};

const PENDING_CALL_KEY: &str = "incomingCallData";

/// Everything needed to answer an incoming call after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallRecord {
    pub call_id: CallId,
    /// Telephony-UI uuid minted on first sighting, stable across re-sightings.
    pub uuid: String,
    pub caller_id: UserId,
    pub call_type: CallMediaType,
    pub caller_name: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub rtp_capabilities: Option<serde_json::Value>,
    #[serde(default)]
    pub participants_info: HashMap<UserId, ParticipantInfo>,
}

/// Typed wrapper over the injected byte store, owning the fixed record key.
pub struct PendingCallStore {
    backend: Arc<dyn KeyValueStore>,
}

impl PendingCallStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub async fn save(&self, record: &PendingCallRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record).map_err(|_| StoreError::Codec)?;
        self.backend.set(PENDING_CALL_KEY, &bytes).await
    }

    pub async fn load(&self) -> Result<Option<PendingCallRecord>, StoreError> {
        match self.backend.get(PENDING_CALL_KEY).await? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|_| StoreError::Codec)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.backend.delete(PENDING_CALL_KEY).await
    }
}

/// In-memory backend. Production hosts inject their own persistent store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
