use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use scc::hash_map::Entry;
use tokio::time::Instant;
use url::Url;

use crate::ports::result_store::{ResultStore, StoreError, StoreResult};

#[derive(Clone)]
struct StoredResult {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredResult {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Process-local result store. Entries with a TTL disappear lazily on read.
#[derive(Default)]
pub struct InMemoryResultStore {
    entries: scc::HashMap<String, StoredResult>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let now = Instant::now();
        let stored = self
            .entries
            .get_async(key)
            .await
            .map(|entry| entry.get().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if !stored.is_live(now) {
            self.entries
                .remove_if_async(key, |entry| !entry.is_live(now))
                .await;
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(stored.value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let stored = StoredResult {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = stored;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(stored);
            }
        }
        Ok(())
    }
}

/// Result store backed by a key/value HTTP service.
///
/// `GET <base>/<key>` reads a value (404 when absent) and
/// `PUT <base>/<key>?ttl=<secs>` writes one.
pub struct HttpResultStore {
    base: Url,
    client: Client,
}

impl HttpResultStore {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| eyre::eyre!("Invalid result store URL '{base_url}': {e}"))?;
        if base.cannot_be_a_base() {
            eyre::bail!("Result store URL '{base_url}' cannot be used as a base");
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }

    fn key_url(&self, key: &str) -> StoreResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Backend(format!("'{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl ResultStore for HttpResultStore {
    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let url = self.key_url(key)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("GET {key}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|e| StoreError::Backend(format!("reading value of {key}: {e}"))),
            status => Err(StoreError::Backend(format!("GET {key} returned {status}"))),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let mut url = self.key_url(key)?;
        if let Some(ttl) = ttl {
            url.query_pairs_mut()
                .append_pair("ttl", &ttl.as_secs().max(1).to_string());
        }

        let response = self
            .client
            .put(url)
            .body(value)
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("PUT {key}: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Backend(format!(
                "PUT {key} returned {}",
                response.status()
            )))
        }
    }
}
