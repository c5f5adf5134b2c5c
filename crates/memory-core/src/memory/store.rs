//! ============================================================================
//! Vector Memory Store - Namespace-scoped record store
//! ============================================================================
//! Wraps an embedder and a `VectorIndex`. Every call is scoped to one
//! `(owner, memory_type)` namespace except admin listing.
//! ============================================================================

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::embeddings::{fit_dimension, Embedder};
use super::index::{FilterEncoding, IndexDocument, IndexQuery, VectorIndex};
use super::types::{MemoryType, MetadataFilter, Namespace, NamespacePattern, StoredItem};
use crate::config::{DistanceMetric, StoreConfig};
use crate::error::{require_id, MemoryError};

/// Fields embedded when callers do not say otherwise
pub const DEFAULT_INDEXED_FIELDS: &[&str] = &["summary"];

/// Filter encodings tried in order before falling back to an unfiltered query
const FILTER_LADDER: [Option<FilterEncoding>; 3] = [
    Some(FilterEncoding::Typed),
    Some(FilterEncoding::Coerced),
    None,
];

/// Over-fetch factor when filtering happens client-side only
const UNFILTERED_OVERFETCH: usize = 4;

/// Minimum importance of each sampling tier, highest first
const IMPORTANCE_TIERS: [u8; 3] = [4, 3, 1];

/// Map a backend distance to a similarity in [0, 1]
pub fn normalize_score(metric: DistanceMetric, distance: f32) -> f32 {
    let score = match metric {
        DistanceMetric::Cosine => 1.0 - distance,
        _ => 1.0 / (1.0 + distance.max(0.0)),
    };
    score.clamp(0.0, 1.0)
}

/// Outcome of a chunked delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteReport {
    pub requested: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// One slice of the owner scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnerPage {
    pub owners: Vec<String>,
    /// Owners seen past the cap
    pub deferred: usize,
}

/// Namespace-scoped approximate nearest neighbor store

pub struct VectorMemoryStore {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: StoreConfig,
}

impl VectorMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, config: StoreConfig) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder.embed_single(text).await?;
        Ok(fit_dimension(vector, self.config.embedding_dim))
    }

    /// Insert or overwrite `key` in `namespace`.
    ///
    /// The vector covers the concatenated `indexed_fields`; with none (or
    /// empty text) a zero vector is stored and the record is only reachable
    /// by key or listing. The first write's `created_at` survives overwrites.
    pub async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        mut value: super::types::MemoryRecord,
        indexed_fields: &[&str],
    ) -> Result<StoredItem> {
        require_id(key, "key")?;

        let now = Utc::now();
        value.id = key.to_string();
        value.owner_id = namespace.owner_id.clone();
        value.memory_type = namespace.memory_type;
        value.last_accessed = now;
        value.refresh_derived();

        let text = value.indexed_text(indexed_fields);
        let vector = if text.is_empty() {
            vec![0.0; self.config.embedding_dim]
        } else {
            self.embed(&text).await?
        };

        let created_at = match self.index.get(namespace, key).await? {
            Some(existing) => existing.created_at,
            None => now,
        };

        let document = IndexDocument {
            namespace: namespace.clone(),
            key: key.to_string(),
            record: value,
            created_at,
            updated_at: now,
        };
        self.index.upsert(document.clone(), vector).await?;

        debug!("Stored {}/{}", namespace, key);
        Ok(into_item(document, None))
    }

    /// Point lookup; a missing key is `None`
    pub async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<StoredItem>> {
        require_id(key, "key")?;
        Ok(self
            .index
            .get(namespace, key)
            .await?
            .map(|doc| into_item(doc, None)))
    }

    /// Similarity search ranked by normalized score.
    ///
    /// Filters walk the encoding ladder when the backend rejects them; the
    /// full filter is always re-applied client-side.
    pub async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        filter: Option<&MetadataFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredItem>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let vector = self.embed(query).await?;
        let metric = self.index.metric();

        let filter = filter.filter(|f| !f.is_empty());
        let ladder: &[Option<FilterEncoding>] = match filter {
            Some(_) => &FILTER_LADDER,
            None => &[None],
        };

        for encoding in ladder {
            let (request_limit, request_offset) = match (filter, encoding) {
                (Some(_), None) => ((limit + offset) * UNFILTERED_OVERFETCH, 0),
                _ => (limit, offset),
            };

            let request = IndexQuery {
                namespace: namespace.clone(),
                vector: vector.clone(),
                filter: filter.zip(*encoding).map(|(f, e)| (f.clone(), e)),
                limit: request_limit,
                offset: request_offset,
            };

            match self.index.query(request).await {
                Ok(hits) => {
                    let mut items: Vec<StoredItem> = hits
                        .into_iter()
                        .filter(|hit| filter.map_or(true, |f| f.matches(&hit.document.record)))
                        .map(|hit| {
                            let score = normalize_score(metric, hit.distance);
                            into_item(hit.document, Some(score))
                        })
                        .collect();

                    if filter.is_some() && encoding.is_none() {
                        items = items.into_iter().skip(offset).take(limit).collect();
                    }

                    debug!("Search in {} returned {} items", namespace, items.len());
                    return Ok(items);
                }
                Err(e) => match e.downcast_ref::<MemoryError>() {
                    Some(MemoryError::FilterRejected(reason)) => {
                        warn!("Backend rejected {:?} filter ({}), simplifying", encoding, reason);
                        continue;
                    }
                    _ => return Err(e),
                },
            }
        }

        Err(MemoryError::FilterRejected(format!("all filter encodings rejected in {}", namespace)).into())
    }

    pub async fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        require_id(key, "key")?;
        self.index.delete(namespace, &[key.to_string()]).await?;
        debug!("Deleted {}/{}", namespace, key);
        Ok(())
    }

    /// Delete in backend-sized chunks; a failed chunk is counted and skipped
    pub async fn batch_delete(&self, namespace: &Namespace, keys: &[String]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport {
            requested: keys.len(),
            ..Default::default()
        };

        for chunk in keys.chunks(self.config.batch_delete_chunk.max(1)) {
            match self.index.delete(namespace, chunk).await {
                Ok(deleted) => report.deleted += deleted,
                Err(e) => {
                    warn!("Batch delete of {} keys in {} failed: {}", chunk.len(), namespace, e);
                    report.failed += chunk.len();
                }
            }
        }

        if report.requested > 0 {
            info!(
                "Batch delete in {}: {} deleted, {} failed",
                namespace, report.deleted, report.failed
            );
        }
        report
    }

    /// Paginated scan of every namespace the pattern matches.
    ///
    /// Stops at `limit` items or `max_list_pages` pages, whichever is first.
    pub async fn list_by_namespace(
        &self,
        pattern: &NamespacePattern,
        limit: Option<usize>,
    ) -> Result<Vec<StoredItem>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        let mut cursor = None;

        for page_number in 0..self.config.max_list_pages {
            let page = self
                .index
                .scroll(pattern, self.config.list_page_size.max(1), cursor)
                .await?;

            items.extend(
                page.documents
                    .into_iter()
                    .filter(|doc| pattern.matches(&doc.namespace))
                    .map(|doc| into_item(doc, None)),
            );

            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            if page_number + 1 == self.config.max_list_pages {
                warn!(
                    "Listing {:?} hit the {} page cap; results are partial",
                    pattern, self.config.max_list_pages
                );
            }
        }

        Ok(items)
    }

    pub async fn count(&self, namespace: &Namespace) -> Result<usize> {
        self.index.count(namespace).await
    }

    /// Owners sorting after `after`, the first `cap` of them
    ///
    /// Scans at most `max_list_pages` pages; owners found past the cap are
    /// reported in `deferred` so callers can resume from the last returned owner.
    pub async fn distinct_owners(&self, after: Option<&str>, cap: usize) -> Result<OwnerPage> {
        let mut owners = BTreeSet::new();
        let mut cursor = None;

        for page_number in 0..self.config.max_list_pages {
            let page = self
                .index
                .scroll(&NamespacePattern::any(), self.config.list_page_size.max(1), cursor)
                .await?;

            owners.extend(
                page.documents
                    .into_iter()
                    .map(|doc| doc.namespace.owner_id)
                    .filter(|owner| after.map_or(true, |after| owner.as_str() > after)),
            );

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            if page_number + 1 == self.config.max_list_pages {
                warn!(
                    "Owner scan hit the {} page cap; some owners are not visible this run",
                    self.config.max_list_pages
                );
            }
        }

        let deferred = owners.len().saturating_sub(cap);
        Ok(OwnerPage {
            owners: owners.into_iter().take(cap).collect(),
            deferred,
        })
    }

    /// Pick one semantic memory, biased toward high importance and recency
    pub async fn get_random_recent_high_importance(&self, owner_id: &str) -> Result<Option<StoredItem>> {
        let namespace = Namespace::new(owner_id, MemoryType::Semantic)?;
        let mut sample = self
            .list_by_namespace(&NamespacePattern::from(&namespace), Some(self.config.sample_fanout))
            .await?;
        if sample.is_empty() {
            return Ok(None);
        }

        // Highest non-empty importance tier
        let tier = IMPORTANCE_TIERS
            .into_iter()
            .find(|min| sample.iter().any(|item| item.value.importance >= *min))
            .unwrap_or(1);
        sample.retain(|item| item.value.importance >= tier);

        sample.sort_by(|a, b| b.value.last_accessed.cmp(&a.value.last_accessed));
        sample.truncate(5);

        // Recency-ranked weights: newest gets the most
        let weights: Vec<u32> = (0..sample.len())
            .map(|rank| (sample.len() - rank) as u32 * sample[rank].value.importance as u32)
            .collect();
        let total: u32 = weights.iter().sum();
        let mut pick = rand::thread_rng().gen_range(0..total.max(1));

        for (item, weight) in sample.iter().zip(weights.iter()) {
            if pick < *weight {
                return Ok(Some(item.clone()));
            }
            pick -= weight;
        }
        Ok(sample.into_iter().next())
    }
}

fn into_item(document: IndexDocument, score: Option<f32>) -> StoredItem {
    StoredItem {
        namespace: document.namespace,
        key: document.key,
        value: document.record,
        created_at: document.created_at,
        updated_at: document.updated_at,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::index::InMemoryIndex;
    use crate::memory::testing::{store_with, TableEmbedder};
    use crate::memory::types::MemoryRecord;

    fn record(summary: &str, importance: u8) -> MemoryRecord {
        MemoryRecord::new("u1", MemoryType::Semantic, "pets", summary, importance)
    }

    #[test]
    fn test_normalize_score() {
        assert!((normalize_score(DistanceMetric::Cosine, 0.14) - 0.86).abs() < 1e-6);
        assert_eq!(normalize_score(DistanceMetric::Euclidean, 0.0), 1.0);
        assert_eq!(normalize_score(DistanceMetric::Euclidean, 1.0), 0.5);
        assert_eq!(normalize_score(DistanceMetric::Cosine, 1.5), 0.0);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_and_preserves_created_at() {
        let (store, index) = store_with(InMemoryIndex::new());
        let ns = Namespace::semantic("u1").unwrap();

        let first = store.put(&ns, "k1", record("User has a dog", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.put(&ns, "k1", record("User has a dog", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();

        assert_eq!(index.len().await, 1);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (store, _) = store_with(InMemoryIndex::new());
        let ns = Namespace::semantic("u1").unwrap();
        let value = record("User has a dog", 3).with_tags(["animals"]).pinned(true);

        let stored = store.put(&ns, &value.id.clone(), value.clone(), DEFAULT_INDEXED_FIELDS).await.unwrap();
        let fetched = store.get(&ns, &stored.key).await.unwrap().unwrap();

        let mut expected = value;
        expected.last_accessed = fetched.value.last_accessed;
        assert_eq!(fetched.value, expected);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (store, _) = store_with(InMemoryIndex::new());
        let ns = Namespace::semantic("u1").unwrap();
        assert!(store.get(&ns, "nope").await.unwrap().is_none());
        assert!(store.get(&ns, "").await.is_err());
    }

    #[tokio::test]
    async fn test_search_scores_and_scopes() {
        let (store, _) = store_with(InMemoryIndex::new());
        let ns = Namespace::semantic("u1").unwrap();
        let other = Namespace::semantic("u2").unwrap();

        store.put(&ns, "dog", record("User has a dog", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();
        store.put(&other, "dog", record("User has a dog", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();

        let hits = store.search(&ns, "User has a dog and two cats", None, 5, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].namespace, ns);
        assert!((hits[0].score.unwrap() - 0.86).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_filter_ladder_falls_back() {
        let index = InMemoryIndex::new().rejecting([FilterEncoding::Typed, FilterEncoding::Coerced]);
        let (store, index) = store_with(index);
        let ns = Namespace::semantic("u1").unwrap();

        store.put(&ns, "dog", record("User has a dog", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();
        let mut work = record("User works at a bakery", 2);
        work.category = "work".to_string();
        store.put(&ns, "job", work, DEFAULT_INDEXED_FIELDS).await.unwrap();

        let filter = MetadataFilter::new().eq("category", "pets");
        let hits = store.search(&ns, "User has a dog", Some(&filter), 5, 0).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "dog");
        assert_eq!(
            index.query_log(),
            vec![
                Some(FilterEncoding::Typed),
                Some(FilterEncoding::Coerced),
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_coerced_rung_serves_typed_fields() {
        let index = InMemoryIndex::new().rejecting([FilterEncoding::Typed]);
        let (store, index) = store_with(index);
        let ns = Namespace::semantic("u1").unwrap();

        store.put(&ns, "dog", record("User has a dog", 3), DEFAULT_INDEXED_FIELDS).await.unwrap();
        store.put(&ns, "cat", record("User has a cat", 2), DEFAULT_INDEXED_FIELDS).await.unwrap();
        let mut work = record("User works at a bakery", 3);
        work.category = "work".to_string();
        store.put(&ns, "job", work, DEFAULT_INDEXED_FIELDS).await.unwrap();

        let filter = MetadataFilter::new().eq("category", "pets").eq("importance", 3i64);
        let hits = store.search(&ns, "User has a dog", Some(&filter), 5, 0).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "dog");
        assert_eq!(
            index.query_log(),
            vec![Some(FilterEncoding::Typed), Some(FilterEncoding::Coerced)]
        );
    }

    #[tokio::test]
    async fn test_zero_vector_when_unindexed() {
        let embedder = Arc::new(TableEmbedder::new(8).failing());
        let index = Arc::new(InMemoryIndex::new());
        let store = VectorMemoryStore::new(embedder, index, StoreConfig { embedding_dim: 8, ..Default::default() });
        let ns = Namespace::semantic("u1").unwrap();

        // No embedding call is made, so the failing embedder is never hit
        store.put(&ns, "k", record("anything", 2), &[]).await.unwrap();
        assert!(store.put(&ns, "k2", record("anything", 2), DEFAULT_INDEXED_FIELDS).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_delete_chunks() {
        let embedder = Arc::new(TableEmbedder::new(8));
        let index = Arc::new(InMemoryIndex::new());
        let store = VectorMemoryStore::new(
            embedder,
            index.clone(),
            StoreConfig {
                embedding_dim: 8,
                batch_delete_chunk: 2,
                ..Default::default()
            },
        );
        let ns = Namespace::semantic("u1").unwrap();
        let mut keys = Vec::new();
        for i in 0..5 {
            let key = format!("k{}", i);
            store.put(&ns, &key, record(&format!("fact {}", i), 2), &[]).await.unwrap();
            keys.push(key);
        }

        let report = store.batch_delete(&ns, &keys).await;
        assert_eq!(report, BatchDeleteReport { requested: 5, deleted: 5, failed: 0 });
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_wildcards_and_page_cap() {
        let embedder = Arc::new(TableEmbedder::new(8));
        let index = Arc::new(InMemoryIndex::new());
        let store = VectorMemoryStore::new(
            embedder,
            index,
            StoreConfig {
                embedding_dim: 8,
                list_page_size: 2,
                max_list_pages: 2,
                ..Default::default()
            },
        );
        let semantic = Namespace::semantic("u1").unwrap();
        let episodic = Namespace::episodic("u1").unwrap();
        store.put(&semantic, "s0", record("fact", 2), &[]).await.unwrap();
        store.put(&episodic, "e0", record("episode", 2), &[]).await.unwrap();

        let pattern = NamespacePattern::parse("u1/episodic").unwrap();
        let episodes = store.list_by_namespace(&pattern, None).await.unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].key, "e0");
        assert_eq!(episodes[0].namespace, episodic);

        for i in 1..6 {
            store.put(&semantic, &format!("s{}", i), record("fact", 2), &[]).await.unwrap();
        }

        // 7 records, but two pages of two is the cap
        let all = store.list_by_namespace(&NamespacePattern::owner("u1"), None).await.unwrap();
        assert_eq!(all.len(), 4);
        let capped = store.list_by_namespace(&NamespacePattern::any(), Some(3)).await.unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn test_distinct_owners_resume_after_cursor() {
        let (store, _) = store_with(InMemoryIndex::new());
        for owner in ["a", "b", "c", "d", "e"] {
            let ns = Namespace::semantic(owner).unwrap();
            store.put(&ns, "k", MemoryRecord::new(owner, MemoryType::Semantic, "x", "fact", 2), &[]).await.unwrap();
        }

        let all = store.distinct_owners(None, 10).await.unwrap();
        assert_eq!(all, OwnerPage { owners: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()], deferred: 0 });

        let first = store.distinct_owners(None, 2).await.unwrap();
        assert_eq!(first.owners, vec!["a", "b"]);
        assert_eq!(first.deferred, 3);

        let second = store.distinct_owners(Some("b"), 2).await.unwrap();
        assert_eq!(second.owners, vec!["c", "d"]);
        assert_eq!(second.deferred, 1);

        let last = store.distinct_owners(Some("d"), 2).await.unwrap();
        assert_eq!(last, OwnerPage { owners: vec!["e".into()], deferred: 0 });
    }

    #[tokio::test]
    async fn test_distinct_owners_scan_is_page_capped() {
        let embedder = Arc::new(TableEmbedder::new(8));
        let index = Arc::new(InMemoryIndex::new());
        let store = VectorMemoryStore::new(
            embedder,
            index,
            StoreConfig {
                embedding_dim: 8,
                list_page_size: 1,
                max_list_pages: 3,
                ..Default::default()
            },
        );
        for owner in ["a", "b", "c", "d", "e"] {
            let ns = Namespace::semantic(owner).unwrap();
            store.put(&ns, "k", MemoryRecord::new(owner, MemoryType::Semantic, "x", "fact", 2), &[]).await.unwrap();
        }

        let page = store.distinct_owners(None, 10).await.unwrap();
        assert_eq!(page.owners, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_random_sample_prefers_high_importance() {
        let (store, _) = store_with(InMemoryIndex::new());
        let ns = Namespace::semantic("u1").unwrap();
        store.put(&ns, "low", record("trivia", 1), &[]).await.unwrap();
        store.put(&ns, "high", record("critical", 5), &[]).await.unwrap();

        for _ in 0..10 {
            let pick = store.get_random_recent_high_importance("u1").await.unwrap().unwrap();
            assert_eq!(pick.key, "high");
        }
        assert!(store.get_random_recent_high_importance("nobody").await.unwrap().is_none());
    }
}
