use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The key has no stored value; the normal path for a first invocation
    #[error("no result stored for key '{0}'")]
    NotFound(String),

    #[error("result store failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value store holding completed function results, keyed by function uid.
///
/// Implementations must offer read-after-write consistency for a single key.
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    /// Stores `value`; `ttl = None` keeps it until overwritten.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()>;
}
