//! ============================================================================
//! Retention - Per-namespace capacity limits and eviction
//! ============================================================================
//! Every create path calls `ensure_capacity` first. Counts come from a
//! cached counter in the session store when present, and from the vector
//! store otherwise (which then repopulates the cache).
//! ============================================================================

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session::SessionKv;
use super::store::VectorMemoryStore;
use super::types::{MemoryType, Namespace, NamespacePattern, StoredItem};
use crate::config::RetentionConfig;

pub struct RetentionPolicy {
    store: Arc<VectorMemoryStore>,
    session: Arc<dyn SessionKv>,
    config: RetentionConfig,
}

fn counter_key(namespace: &Namespace) -> String {
    format!("count:{}", namespace.path())
}

impl RetentionPolicy {
    pub fn new(store: Arc<VectorMemoryStore>, session: Arc<dyn SessionKv>, config: RetentionConfig) -> Self {
        Self {
            store,
            session,
            config,
        }
    }

    pub fn max_records(&self, memory_type: MemoryType) -> usize {
        match memory_type {
            MemoryType::Semantic => self.config.max_semantic,
            MemoryType::Episodic => self.config.max_episodic,
        }
    }

    /// Records in the namespace, read through the cached counter
    pub async fn current_count(&self, namespace: &Namespace) -> Result<usize> {
        let key = counter_key(namespace);

        if self.config.cached_counter {
            match self.session.get_counter(&key).await {
                Ok(Some(count)) => return Ok(count.max(0) as usize),
                Ok(None) => {}
                Err(e) => warn!("Counter read for {} failed: {}", namespace, e),
            }
        }

        let count = self.store.count(namespace).await?;
        if self.config.cached_counter {
            if let Err(e) = self.session.set_counter(&key, count as i64).await {
                warn!("Counter write for {} failed: {}", namespace, e);
            }
        }
        debug!("Recounted {}: {}", namespace, count);
        Ok(count)
    }

    /// Make room for one more record, evicting the oldest while at capacity.
    /// Returns the evicted keys.
    ///
    /// The cached counter only gates the listing; the eviction count comes
    /// from the listed records, and the counter is reset to match them.
    pub async fn ensure_capacity(&self, namespace: &Namespace) -> Result<Vec<String>> {
        let max = self.max_records(namespace.memory_type);
        let count = self.current_count(namespace).await?;
        if count < max {
            return Ok(vec![]);
        }

        let mut items = self
            .store
            .list_by_namespace(&NamespacePattern::from(namespace), None)
            .await?;
        let listed = items.len();

        if self.config.cached_counter && listed != count {
            debug!("Counter for {} drifted ({} cached, {} listed)", namespace, count, listed);
            if let Err(e) = self.session.set_counter(&counter_key(namespace), listed as i64).await {
                warn!("Counter reset for {} failed: {}", namespace, e);
            }
        }
        if listed < max {
            return Ok(vec![]);
        }

        let excess = listed + 1 - max;
        items.sort_by(|a, b| eviction_order(a).cmp(&eviction_order(b)));

        let mut evicted = Vec::with_capacity(excess);
        let mut failure = None;
        for item in items.into_iter().take(excess) {
            match self.store.delete(namespace, &item.key).await {
                Ok(()) => {
                    info!("Evicted {}/{} (limit {})", namespace, item.key, max);
                    evicted.push(item.key);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.adjust(namespace, -(evicted.len() as i64)).await;
        match failure {
            Some(e) => Err(e.context(format!(
                "eviction in {} stopped after {} of {} deletes",
                namespace,
                evicted.len(),
                excess
            ))),
            None => Ok(evicted),
        }
    }

    /// Note a successful create
    pub async fn record_created(&self, namespace: &Namespace) {
        self.adjust(namespace, 1).await;
    }

    /// Note deletions done outside `ensure_capacity`
    pub async fn record_deleted(&self, namespace: &Namespace, count: usize) {
        self.adjust(namespace, -(count as i64)).await;
    }

    /// Drop the cached counter so the next read recounts
    pub async fn invalidate(&self, namespace: &Namespace) {
        if let Err(e) = self.session.delete(&counter_key(namespace)).await {
            warn!("Counter invalidation for {} failed: {}", namespace, e);
        }
    }

    async fn adjust(&self, namespace: &Namespace, delta: i64) {
        if !self.config.cached_counter || delta == 0 {
            return;
        }
        if let Err(e) = self.session.incr_counter(&counter_key(namespace), delta).await {
            warn!("Counter update for {} failed: {}", namespace, e);
        }
    }
}

/// Oldest first: `last_accessed`, then the record's own `created_at`
fn eviction_order(item: &StoredItem) -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
    (item.value.last_accessed, item.value.created_at)
}
