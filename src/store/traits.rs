//! Durable key-value storage seam.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt stored record")]
    Codec,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Byte-oriented get/set/delete store. The core uses it for exactly one
/// purpose: remembering "there is a pending call" across process restarts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}
