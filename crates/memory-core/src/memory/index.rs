//! ============================================================================
//! Vector Index - Backend abstraction under the memory store
//! ============================================================================
//! The store speaks to any namespace-scoped ANN index through `VectorIndex`.
//! `QdrantIndex` is the production backend; `InMemoryIndex` is a brute-force
//! index for local runs and tests.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{FilterValue, MemoryRecord, MetadataFilter, Namespace, NamespacePattern};
use crate::config::DistanceMetric;
use crate::error::MemoryError;

/// A record as persisted by the backend (vector omitted)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub namespace: Namespace,
    pub key: String,
    pub record: MemoryRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Query result with the backend's raw distance
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: IndexDocument,
    pub distance: f32,
}

/// How metadata conditions are handed to the backend, most to least precise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterEncoding {
    /// Every condition with its native type (keyword, integer, bool)
    Typed,
    /// Every condition as its string form, matched as a keyword
    Coerced,
}

/// A similarity query inside one namespace
#[derive(Debug, Clone)]
pub struct IndexQuery {
    pub namespace: Namespace,
    pub vector: Vec<f32>,
    /// Conditions plus the encoding to send them with; `None` is unfiltered
    pub filter: Option<(MetadataFilter, FilterEncoding)>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of a namespace scan
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    pub documents: Vec<IndexDocument>,
    /// Continuation token; `None` once the scan is exhausted
    pub next_cursor: Option<String>,
}

/// Namespace-scoped approximate nearest neighbor backend
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Metric used to interpret `ScoredDocument::distance`
    fn metric(&self) -> DistanceMetric;

    /// Insert or overwrite by `(namespace, key)`
    async fn upsert(&self, document: IndexDocument, vector: Vec<f32>) -> Result<()>;

    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<IndexDocument>>;

    /// Nearest neighbors, closest first. A filter the backend cannot
    /// evaluate fails with `MemoryError::FilterRejected`.
    async fn query(&self, query: IndexQuery) -> Result<Vec<ScoredDocument>>;

    /// Page through documents; wildcard components may over-match
    async fn scroll(
        &self,
        pattern: &NamespacePattern,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<IndexPage>;

    /// Delete keys, returning how many were sent for deletion
    async fn delete(&self, namespace: &Namespace, keys: &[String]) -> Result<usize>;

    async fn count(&self, namespace: &Namespace) -> Result<usize>;
}

/// Conditions as sent to the backend under `encoding`
pub fn encode_filter(filter: &MetadataFilter, encoding: FilterEncoding) -> MetadataFilter {
    match encoding {
        FilterEncoding::Typed => filter.clone(),
        FilterEncoding::Coerced => MetadataFilter {
            conditions: filter
                .conditions
                .iter()
                .map(|(field, value)| (field.clone(), FilterValue::Text(value.as_keyword())))
                .collect(),
        },
    }
}

/// Cosine similarity; zero vectors are orthogonal to everything
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Dot => {
            let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
            (1.0 - dot).max(0.0)
        }
    }
}

type EntryKey = (Namespace, String);

/// Brute-force in-process index
pub struct InMemoryIndex {
    metric: DistanceMetric,
    entries: RwLock<BTreeMap<EntryKey, (IndexDocument, Vec<f32>)>>,
    rejected_encodings: HashSet<FilterEncoding>,
    query_log: Mutex<Vec<Option<FilterEncoding>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::with_metric(DistanceMetric::Cosine)
    }

    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self {
            metric,
            entries: RwLock::new(BTreeMap::new()),
            rejected_encodings: HashSet::new(),
            query_log: Mutex::new(Vec::new()),
        }
    }

    /// Reject these encodings the way a strict backend rejects unindexed fields
    pub fn rejecting(mut self, encodings: impl IntoIterator<Item = FilterEncoding>) -> Self {
        self.rejected_encodings.extend(encodings);
        self
    }

    /// Filter encodings of every query received, in order
    pub fn query_log(&self) -> Vec<Option<FilterEncoding>> {
        self.query_log.lock().clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn upsert(&self, document: IndexDocument, vector: Vec<f32>) -> Result<()> {
        let key = (document.namespace.clone(), document.key.clone());
        self.entries.write().await.insert(key, (document, vector));
        Ok(())
    }

    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<IndexDocument>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(namespace.clone(), key.to_string()))
            .map(|(doc, _)| doc.clone()))
    }

    async fn query(&self, query: IndexQuery) -> Result<Vec<ScoredDocument>> {
        let encoding = query.filter.as_ref().map(|(_, e)| *e);
        self.query_log.lock().push(encoding);

        let server_filter = match &query.filter {
            Some((filter, encoding)) => {
                if self.rejected_encodings.contains(encoding) {
                    return Err(MemoryError::FilterRejected(format!(
                        "{:?} filter on {:?}",
                        encoding,
                        filter.conditions.keys().collect::<Vec<_>>()
                    ))
                    .into());
                }
                Some(encode_filter(filter, *encoding))
            }
            None => None,
        };

        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .filter(|((ns, _), _)| *ns == query.namespace)
            .filter(|(_, (doc, _))| {
                server_filter
                    .as_ref()
                    .map_or(true, |f| f.matches(&doc.record))
            })
            .map(|(_, (doc, vector))| ScoredDocument {
                document: doc.clone(),
                distance: distance(self.metric, &query.vector, vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(scored
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn scroll(
        &self,
        pattern: &NamespacePattern,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<IndexPage> {
        let after: Option<EntryKey> = match cursor {
            Some(raw) => Some(
                serde_json::from_str(&raw).map_err(|e| anyhow!("Invalid scroll cursor: {}", e))?,
            ),
            None => None,
        };

        let entries = self.entries.read().await;
        let mut documents = Vec::with_capacity(limit);
        let mut last_key: Option<&EntryKey> = None;
        let mut has_more = false;

        for (key, (doc, _)) in entries.iter() {
            if let Some(after) = &after {
                if key <= after {
                    continue;
                }
            }
            // Owner is filtered "server side"; the type component is left to the caller
            if let Some(owner) = &pattern.owner_id {
                if &key.0.owner_id != owner {
                    continue;
                }
            }
            if documents.len() == limit {
                has_more = true;
                break;
            }
            documents.push(doc.clone());
            last_key = Some(key);
        }

        let next_cursor = if has_more {
            last_key.map(serde_json::to_string).transpose()?
        } else {
            None
        };

        debug!("Scrolled {} documents (more: {})", documents.len(), has_more);
        Ok(IndexPage {
            documents,
            next_cursor,
        })
    }

    async fn delete(&self, namespace: &Namespace, keys: &[String]) -> Result<usize> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(&(namespace.clone(), key.clone()));
        }
        Ok(keys.len())
    }

    async fn count(&self, namespace: &Namespace) -> Result<usize> {
        let entries = self.entries.read().await;
        Ok(entries.keys().filter(|(ns, _)| ns == namespace).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryType;

    fn doc(owner: &str, key: &str, category: &str) -> IndexDocument {
        let now = Utc::now();
        let namespace = Namespace::semantic(owner).unwrap();
        let mut record = MemoryRecord::new(owner, MemoryType::Semantic, category, key, 3);
        record.id = key.to_string();
        IndexDocument {
            namespace,
            key: key.to_string(),
            record,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_coerced_filter_stringifies_every_condition() {
        let filter = MetadataFilter::new()
            .eq("category", "pets")
            .eq("importance", 3i64)
            .eq("pinned", true);

        assert_eq!(encode_filter(&filter, FilterEncoding::Typed), filter);

        let coerced = encode_filter(&filter, FilterEncoding::Coerced);
        assert_eq!(coerced.conditions.len(), 3);
        assert_eq!(coerced.conditions["category"], FilterValue::Text("pets".into()));
        assert_eq!(coerced.conditions["importance"], FilterValue::Text("3".into()));
        assert_eq!(coerced.conditions["pinned"], FilterValue::Text("true".into()));
    }

    #[tokio::test]
    async fn test_coerced_filter_still_matches_typed_fields() {
        let index = InMemoryIndex::new().rejecting([FilterEncoding::Typed]);
        index.upsert(doc("u1", "a", "pets"), vec![1.0, 0.0]).await.unwrap();
        let filter = MetadataFilter::new().eq("category", "pets").eq("importance", 3i64);

        let hits = index
            .query(IndexQuery {
                namespace: Namespace::semantic("u1").unwrap(),
                vector: vec![1.0, 0.0],
                filter: Some((filter, FilterEncoding::Coerced)),
                limit: 5,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_query_orders_by_distance() {
        let index = InMemoryIndex::new();
        index.upsert(doc("u1", "a", "pets"), vec![1.0, 0.0]).await.unwrap();
        index.upsert(doc("u1", "b", "pets"), vec![0.6, 0.8]).await.unwrap();
        index.upsert(doc("u2", "c", "pets"), vec![1.0, 0.0]).await.unwrap();

        let hits = index
            .query(IndexQuery {
                namespace: Namespace::semantic("u1").unwrap(),
                vector: vec![1.0, 0.0],
                filter: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.key, "a");
        assert_eq!(hits[1].document.key, "b");
    }

    #[tokio::test]
    async fn test_rejected_encoding() {
        let index = InMemoryIndex::new().rejecting([FilterEncoding::Typed]);
        let result = index
            .query(IndexQuery {
                namespace: Namespace::semantic("u1").unwrap(),
                vector: vec![1.0],
                filter: Some((MetadataFilter::new().eq("category", "x"), FilterEncoding::Typed)),
                limit: 5,
                offset: 0,
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::FilterRejected(_))
        ));
        assert_eq!(index.query_log(), vec![Some(FilterEncoding::Typed)]);
    }

    #[tokio::test]
    async fn test_scroll_pages() {
        let index = InMemoryIndex::new();
        for key in ["a", "b", "c", "d", "e"] {
            index.upsert(doc("u1", key, "pets"), vec![1.0]).await.unwrap();
        }

        let pattern = NamespacePattern::owner("u1");
        let first = index.scroll(&pattern, 2, None).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert!(first.next_cursor.is_some());

        let second = index.scroll(&pattern, 2, first.next_cursor).await.unwrap();
        assert_eq!(second.documents[0].key, "c");

        let third = index.scroll(&pattern, 2, second.next_cursor).await.unwrap();
        assert_eq!(third.documents.len(), 1);
        assert!(third.next_cursor.is_none());
    }
}
