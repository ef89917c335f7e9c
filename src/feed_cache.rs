use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use crate::db::{Store, StoreError};
use crate::feed::{FeedSource, UpstreamError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache envelope: {0}")]
    Corrupt(String),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEnvelope {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<Value>,
}

impl CacheEnvelope {
    /// Younger than `lifetime`. A timestamp ahead of `now` means the writer's
    /// clock was skewed, so its age is unknown and the envelope is expired.
    fn is_fresh(&self, now: DateTime<Utc>, lifetime: chrono::Duration) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age >= chrono::Duration::zero() && age < lifetime
    }
}

/// Time-boxed cache in front of the upstream feed.
///
/// The envelope lives in the store under the feed's identity. Refreshes are
/// serialized so that callers racing on an expired envelope trigger a single
/// upstream request.
pub struct FeedCache {
    source: Arc<dyn FeedSource>,
    store: Arc<Store>,
    lifetime: chrono::Duration,
    fetch_delay: Duration,
    refresh: AsyncMutex<()>,
}

impl FeedCache {
    pub fn new(
        source: Arc<dyn FeedSource>,
        store: Arc<Store>,
        lifetime: chrono::Duration,
        fetch_delay: Duration,
    ) -> Self {
        Self {
            source,
            store,
            lifetime,
            fetch_delay,
            refresh: AsyncMutex::new(()),
        }
    }

    pub async fn get_events(&self) -> Result<Vec<Value>, UpstreamError> {
        if let Some(data) = self.fresh_payload(Utc::now()) {
            tracing::info!(events = data.len(), "using cached feed data");
            return Ok(data);
        }

        let _guard = self.refresh.lock().await;
        if let Some(data) = self.fresh_payload(Utc::now()) {
            tracing::debug!("feed refreshed by a concurrent caller");
            return Ok(data);
        }

        tracing::info!(feed = self.source.identity(), "fetching fresh feed data");
        let data = self.source.fetch().await?;
        if let Err(err) = self.save(&data) {
            tracing::warn!("failed to store feed cache: {err}");
        }

        // Holding the guard through the delay also spaces out back-to-back refreshes.
        sleep(self.fetch_delay).await;
        Ok(data)
    }

    pub fn invalidate(&self) -> Result<(), CacheError> {
        self.store.delete_cache_payload(self.source.identity())?;
        Ok(())
    }

    fn fresh_payload(&self, now: DateTime<Utc>) -> Option<Vec<Value>> {
        match self.load() {
            Ok(Some(envelope)) if envelope.is_fresh(now, self.lifetime) => Some(envelope.data),
            Ok(Some(envelope)) => {
                tracing::debug!(captured = %envelope.timestamp, "feed cache expired");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("treating feed cache as a miss: {err}");
                None
            }
        }
    }

    fn load(&self) -> Result<Option<CacheEnvelope>, CacheError> {
        let payload = match self.store.load_cache_payload(self.source.identity())? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| CacheError::Corrupt(err.to_string()))
    }

    fn save(&self, data: &[Value]) -> Result<(), CacheError> {
        let envelope = CacheEnvelope {
            timestamp: Utc::now(),
            data: data.to_vec(),
        };
        let payload =
            serde_json::to_string(&envelope).map_err(|err| CacheError::Corrupt(err.to_string()))?;
        self.store
            .save_cache_payload(self.source.identity(), &payload)?;
        Ok(())
    }
}
