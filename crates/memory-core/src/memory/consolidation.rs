//! ============================================================================
//! Offline Consolidation - Fold near-duplicate memories together
//! ============================================================================
//! For every owner and memory type: list the namespace, group records whose
//! summaries are mutually reachable above the similarity threshold, and
//! replace each group with one record written under its newest key.
//! Failures are isolated per owner; the batch always completes.
//! ============================================================================

use anyhow::{anyhow, Result};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::classifier::MemoryClassifier;
use super::retention::RetentionPolicy;
use super::store::{VectorMemoryStore, DEFAULT_INDEXED_FIELDS};
use super::summarizer::Summarizer;
use super::types::{MemoryRecord, MemoryType, Namespace, NamespacePattern, StoredItem};
use crate::config::ConsolidationConfig;
use crate::error::require_id;

const CONSOLIDATION_SOURCE: &str = "consolidation";

/// A failed owner and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerError {
    pub owner_id: String,
    pub message: String,
}

/// Aggregate result of one consolidation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationStats {
    pub owners_processed: usize,
    pub records_scanned: usize,
    /// Records folded into another and deleted
    pub records_merged: usize,
    pub merge_groups: usize,
    pub errors: Vec<OwnerError>,
}

#[derive(Debug, Default)]
struct OwnerStats {
    scanned: usize,
    merged: usize,
    groups: usize,
}

impl OwnerStats {
    fn absorb(&mut self, other: OwnerStats) {
        self.scanned += other.scanned;
        self.merged += other.merged;
        self.groups += other.groups;
    }
}

pub struct ConsolidationService {
    store: Arc<VectorMemoryStore>,
    classifier: MemoryClassifier,
    retention: Arc<RetentionPolicy>,
    config: ConsolidationConfig,
    /// Last owner reached by a capped sweep; the next sweep resumes after it
    owner_cursor: Mutex<Option<String>>,
}

impl ConsolidationService {
    pub fn new(
        store: Arc<VectorMemoryStore>,
        summarizer: Arc<dyn Summarizer>,
        retention: Arc<RetentionPolicy>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            classifier: MemoryClassifier::new(summarizer),
            retention,
            config,
            owner_cursor: Mutex::new(None),
        }
    }

    /// Next slice of owners for a full sweep, wrapping to the start once exhausted
    async fn next_owners(&self) -> Result<Vec<String>> {
        let cap = self.config.max_owners.max(1);
        let after = self.owner_cursor.lock().clone();
        let page = self.store.distinct_owners(after.as_deref(), cap).await?;

        if page.deferred > 0 {
            warn!(
                "Owner cap {} reached; {} owner(s) deferred to the next run",
                cap, page.deferred
            );
        }
        *self.owner_cursor.lock() = if page.deferred > 0 {
            page.owners.last().cloned()
        } else {
            None
        };
        Ok(page.owners)
    }

    /// Consolidate one owner or every active owner, one type or both
    pub async fn run(&self, owner_id: Option<&str>, memory_type: Option<MemoryType>) -> Result<ConsolidationStats> {
        let owners = match owner_id {
            Some(owner) => {
                require_id(owner, "owner_id")?;
                vec![owner.to_string()]
            }
            None => self.next_owners().await?,
        };
        let types: Vec<MemoryType> = match memory_type {
            Some(t) => vec![t],
            None => vec![MemoryType::Semantic, MemoryType::Episodic],
        };

        info!("Consolidating {} owner(s) across {:?}", owners.len(), types);
        let mut stats = ConsolidationStats::default();

        for page in owners.chunks(self.config.owner_page_size.max(1)) {
            let results: Vec<(String, Result<OwnerStats>)> = stream::iter(page.iter().cloned())
                .map(|owner| {
                    let types = &types;
                    async move {
                        let result = self.consolidate_owner(&owner, types).await;
                        (owner, result)
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for (owner, result) in results {
                stats.owners_processed += 1;
                match result {
                    Ok(owner_stats) => {
                        stats.records_scanned += owner_stats.scanned;
                        stats.records_merged += owner_stats.merged;
                        stats.merge_groups += owner_stats.groups;
                    }
                    Err(e) => {
                        error!("Consolidation failed for owner {}: {:#}", owner, e);
                        stats.errors.push(OwnerError {
                            owner_id: owner,
                            message: format!("{:#}", e),
                        });
                    }
                }
            }
        }

        info!(
            "Consolidation done: {} owners, {} scanned, {} merged in {} groups, {} errors",
            stats.owners_processed,
            stats.records_scanned,
            stats.records_merged,
            stats.merge_groups,
            stats.errors.len()
        );
        Ok(stats)
    }

    async fn consolidate_owner(&self, owner_id: &str, types: &[MemoryType]) -> Result<OwnerStats> {
        let mut stats = OwnerStats::default();
        for memory_type in types {
            let namespace = Namespace::new(owner_id, *memory_type)?;
            stats.absorb(self.consolidate_namespace(&namespace).await?);
        }
        Ok(stats)
    }

    async fn consolidate_namespace(&self, namespace: &Namespace) -> Result<OwnerStats> {
        let items = self
            .store
            .list_by_namespace(&NamespacePattern::from(namespace), None)
            .await?;
        let mut stats = OwnerStats {
            scanned: items.len(),
            ..Default::default()
        };
        if items.len() < 2 {
            return Ok(stats);
        }

        let groups = self.group_duplicates(namespace, items).await?;
        let mut deleted_any = false;

        for group in groups.into_iter().filter(|g| g.len() >= 2) {
            let absorbed = self.merge_group(namespace, group).await?;
            stats.groups += 1;
            stats.merged += absorbed;
            deleted_any |= absorbed > 0;
        }

        if deleted_any {
            self.retention.invalidate(namespace).await;
        }
        Ok(stats)
    }

    /// Transitive near-duplicate grouping; unmatched records are singletons
    async fn group_duplicates(&self, namespace: &Namespace, mut items: Vec<StoredItem>) -> Result<Vec<Vec<StoredItem>>> {
        items.sort_by(|a, b| {
            a.value
                .created_at
                .cmp(&b.value.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut by_key: HashMap<String, StoredItem> =
            items.iter().map(|item| (item.key.clone(), item.clone())).collect();
        let mut grouped: HashSet<String> = HashSet::new();
        let mut groups = Vec::new();

        for seed in items {
            if !grouped.insert(seed.key.clone()) {
                continue;
            }

            let mut group = Vec::new();
            let mut frontier = VecDeque::from([seed]);

            while let Some(current) = frontier.pop_front() {
                let hits = self
                    .store
                    .search(namespace, &current.value.summary, None, self.config.search_limit, 0)
                    .await?;

                for hit in hits {
                    let similar = hit.score.unwrap_or(0.0) >= self.config.threshold;
                    if !similar || hit.key == current.key || grouped.contains(&hit.key) {
                        continue;
                    }
                    // Only records seen in this scan take part
                    if let Some(member) = by_key.remove(&hit.key) {
                        grouped.insert(hit.key);
                        frontier.push_back(member);
                    }
                }
                group.push(current);
            }

            if group.len() > 1 {
                debug!("Found {} near-duplicates in {}", group.len(), namespace);
            }
            groups.push(group);
        }

        Ok(groups)
    }

    /// Write the merged record under the newest key, then delete the rest.
    /// Returns how many records were deleted.
    async fn merge_group(&self, namespace: &Namespace, mut group: Vec<StoredItem>) -> Result<usize> {
        group.sort_by(|a, b| {
            a.value
                .created_at
                .cmp(&b.value.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        let Some(newest) = group.last().cloned() else {
            return Ok(0);
        };

        let summaries: Vec<String> = group.iter().map(|item| item.value.summary.clone()).collect();
        let group_max = group.iter().map(|item| item.value.importance).max().unwrap_or(1);
        let merged = compose_group_record(&group, self.classifier.consolidate_group(&summaries).await, group_max);

        self.store
            .put(namespace, &newest.key, merged.clone(), DEFAULT_INDEXED_FIELDS)
            .await?;

        match self.store.get(namespace, &newest.key).await? {
            Some(item) if item.value.summary == merged.summary => {}
            _ => {
                return Err(anyhow!(
                    "merged record {}/{} did not read back; keeping group intact",
                    namespace,
                    newest.key
                ))
            }
        }

        let others: Vec<String> = group
            .iter()
            .filter(|item| item.key != newest.key)
            .map(|item| item.key.clone())
            .collect();
        let report = self.store.batch_delete(namespace, &others).await;
        if report.failed > 0 {
            warn!(
                "{} of {} merged records in {} could not be deleted",
                report.failed, report.requested, namespace
            );
        }

        info!(
            "Merged {} records in {} into {}",
            group.len(),
            namespace,
            newest.key
        );
        Ok(report.deleted)
    }
}

/// One record standing in for a whole group (sorted oldest first)
fn compose_group_record(group: &[StoredItem], merged: Option<(String, u8)>, group_max: u8) -> MemoryRecord {
    let oldest = &group[0].value;
    let newest = &group[group.len() - 1].value;
    let mut record = newest.clone();

    match merged {
        Some((summary, importance)) => {
            record.set_summary(&summary);
            record.display_summary = summary;
            record.importance = importance.max(group_max);
        }
        None => record.importance = group_max,
    }

    record.category = most_frequent_category(group, &newest.category);
    record.pinned = group.iter().any(|item| item.value.pinned);
    for item in group {
        record.tags.extend(item.value.tags.iter().cloned());
    }
    record.created_at = oldest.created_at;
    record.source = CONSOLIDATION_SOURCE.to_string();
    record.extra.insert(
        "consolidated_count".to_string(),
        serde_json::Value::from(group.len() as u64),
    );
    record.refresh_derived();
    record
}

/// Ties go to the newest record's category
fn most_frequent_category(group: &[StoredItem], newest: &str) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in group {
        *counts.entry(item.value.category.as_str()).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    if counts.get(newest).copied() == Some(best) {
        return newest.to_string();
    }
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(category, _)| category.to_string())
        .unwrap_or_else(|| newest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::memory::embeddings::Embedder;
    use crate::memory::index::{IndexDocument, InMemoryIndex, VectorIndex};
    use crate::memory::session::{InMemorySessionStore, SessionKv};
    use crate::memory::testing::{test_store_config, ScriptedSummarizer, TableEmbedder, TEST_DIM};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    const RETRIEVER: &str = "User has a golden retriever";
    const RETRIEVER_MAX: &str = "User has a golden retriever named Max";
    const MAX_PUPPY: &str = "User's retriever Max is a puppy";
    const OSLO: &str = "User lives in Oslo";

    /// Fails for any text mentioning "poison"
    struct PoisonEmbedder(TableEmbedder);

    #[async_trait]
    impl Embedder for PoisonEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(anyhow!("embedding rejected input"));
            }
            self.0.embed(texts).await
        }
    }

    struct Fixture {
        service: ConsolidationService,
        store: Arc<VectorMemoryStore>,
        index: Arc<InMemoryIndex>,
        session: Arc<InMemorySessionStore>,
    }

    fn fixture(summarizer: ScriptedSummarizer) -> Fixture {
        fixture_with(summarizer, ConsolidationConfig::default())
    }

    fn fixture_with(summarizer: ScriptedSummarizer, config: ConsolidationConfig) -> Fixture {
        // Retriever chain: A~B 0.95, B~C 0.95, A~C 0.81
        let embedder = TableEmbedder::new(TEST_DIM)
            .with(RETRIEVER, vec![1.0, 0.0])
            .with(RETRIEVER_MAX, vec![0.95, 0.3122])
            .with(MAX_PUPPY, vec![0.809, 0.5878])
            .with(OSLO, vec![0.0, 0.0, 1.0]);
        let index = Arc::new(InMemoryIndex::new());
        let store = Arc::new(VectorMemoryStore::new(
            Arc::new(PoisonEmbedder(embedder)),
            index.clone(),
            test_store_config(),
        ));
        let session = Arc::new(InMemorySessionStore::new());
        let retention = Arc::new(RetentionPolicy::new(
            store.clone(),
            session.clone(),
            RetentionConfig::default(),
        ));
        let service = ConsolidationService::new(
            store.clone(),
            Arc::new(summarizer),
            retention,
            config,
        );
        Fixture {
            service,
            store,
            index,
            session,
        }
    }

    async fn seed(store: &VectorMemoryStore, owner: &str, summary: &str, category: &str, importance: u8, age_days: i64) -> String {
        let namespace = Namespace::semantic(owner).unwrap();
        let mut record = MemoryRecord::new(owner, MemoryType::Semantic, category, summary, importance);
        record.created_at = Utc::now() - Duration::days(age_days);
        let key = record.id.clone();
        store.put(&namespace, &key, record, DEFAULT_INDEXED_FIELDS).await.unwrap();
        key
    }

    async fn semantic_items(store: &VectorMemoryStore, owner: &str) -> Vec<StoredItem> {
        let namespace = Namespace::semantic(owner).unwrap();
        store
            .list_by_namespace(&NamespacePattern::from(&namespace), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transitive_group_is_merged_under_newest_key() {
        let f = fixture(ScriptedSummarizer::new().on(
            "near-duplicate memories",
            r#"{"summary": "User has a golden retriever puppy named Max", "importance": 3}"#,
        ));
        seed(&f.store, "u1", RETRIEVER, "pets", 2, 30).await;
        seed(&f.store, "u1", RETRIEVER_MAX, "pets", 4, 20).await;
        let newest = seed(&f.store, "u1", MAX_PUPPY, "family", 1, 10).await;
        seed(&f.store, "u1", OSLO, "location", 3, 5).await;

        let stats = f.service.run(Some("u1"), Some(MemoryType::Semantic)).await.unwrap();

        assert_eq!(stats.owners_processed, 1);
        assert_eq!(stats.records_scanned, 4);
        assert_eq!(stats.merge_groups, 1);
        assert_eq!(stats.records_merged, 2);
        assert!(stats.errors.is_empty());

        let items = semantic_items(&f.store, "u1").await;
        assert_eq!(items.len(), 2);
        let merged = items.iter().find(|i| i.key == newest).unwrap();
        assert_eq!(merged.value.summary, "User has a golden retriever puppy named Max");
        // Capability importance never lowers the group's best
        assert_eq!(merged.value.importance, 4);
        assert_eq!(merged.value.category, "pets");
        assert_eq!(merged.value.source, "consolidation");
        assert!(items.iter().any(|i| i.value.summary == OSLO));
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back_to_newest() {
        let f = fixture(ScriptedSummarizer::new().failing());
        seed(&f.store, "u1", RETRIEVER, "pets", 5, 30).await;
        let newest = seed(&f.store, "u1", RETRIEVER_MAX, "pets", 2, 20).await;

        let stats = f.service.run(Some("u1"), None).await.unwrap();
        assert_eq!(stats.merge_groups, 1);

        let items = semantic_items(&f.store, "u1").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, newest);
        assert_eq!(items[0].value.summary, RETRIEVER_MAX);
        assert_eq!(items[0].value.importance, 5);
    }

    #[tokio::test]
    async fn test_distinct_records_are_left_alone() {
        let f = fixture(ScriptedSummarizer::new());
        seed(&f.store, "u1", RETRIEVER, "pets", 2, 3).await;
        seed(&f.store, "u1", OSLO, "location", 2, 2).await;

        let stats = f.service.run(Some("u1"), None).await.unwrap();
        assert_eq!(stats.records_scanned, 2);
        assert_eq!(stats.merge_groups, 0);
        assert_eq!(semantic_items(&f.store, "u1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_owner_failure_is_isolated() {
        let f = fixture(ScriptedSummarizer::new());
        seed(&f.store, "u1", RETRIEVER, "pets", 2, 30).await;
        seed(&f.store, "u1", RETRIEVER_MAX, "pets", 2, 20).await;

        // Bypass the embedder so the poisoned text only fails at search time
        for key in ["p1", "p2"] {
            let mut record = MemoryRecord::new("u2", MemoryType::Semantic, "misc", "poison pill", 1);
            record.id = key.to_string();
            let now = Utc::now();
            f.index
                .upsert(
                    IndexDocument {
                        namespace: Namespace::semantic("u2").unwrap(),
                        key: key.to_string(),
                        record,
                        created_at: now,
                        updated_at: now,
                    },
                    vec![0.0; TEST_DIM],
                )
                .await
                .unwrap();
        }

        let stats = f.service.run(None, Some(MemoryType::Semantic)).await.unwrap();

        assert_eq!(stats.owners_processed, 2);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].owner_id, "u2");
        assert_eq!(stats.merge_groups, 1);
        assert_eq!(semantic_items(&f.store, "u1").await.len(), 1);
        assert_eq!(semantic_items(&f.store, "u2").await.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_invalidates_cached_counter() {
        let f = fixture(ScriptedSummarizer::new());
        seed(&f.store, "u1", RETRIEVER, "pets", 2, 30).await;
        seed(&f.store, "u1", RETRIEVER_MAX, "pets", 2, 20).await;
        f.session.set_counter("count:u1/semantic", 2).await.unwrap();

        f.service.run(Some("u1"), Some(MemoryType::Semantic)).await.unwrap();
        assert_eq!(f.session.get_counter("count:u1/semantic").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capped_sweep_resumes_with_remaining_owners() {
        let f = fixture_with(
            ScriptedSummarizer::new(),
            ConsolidationConfig {
                max_owners: 2,
                ..Default::default()
            },
        );
        for owner in ["a", "b", "c"] {
            seed(&f.store, owner, OSLO, "location", 3, 5).await;
        }

        let first = f.service.run(None, Some(MemoryType::Semantic)).await.unwrap();
        assert_eq!(first.owners_processed, 2);
        assert_eq!(f.service.owner_cursor.lock().as_deref(), Some("b"));

        let second = f.service.run(None, Some(MemoryType::Semantic)).await.unwrap();
        assert_eq!(second.owners_processed, 1);
        assert_eq!(second.records_scanned, 1);
        assert_eq!(*f.service.owner_cursor.lock(), None);

        // Wraps back to the start
        let third = f.service.run(None, Some(MemoryType::Semantic)).await.unwrap();
        assert_eq!(third.owners_processed, 2);
    }

    #[tokio::test]
    async fn test_blank_owner_is_rejected() {
        let f = fixture(ScriptedSummarizer::new());
        assert!(f.service.run(Some("  "), None).await.is_err());
    }

    #[test]
    fn test_most_frequent_category_prefers_newest_on_tie() {
        let item = |category: &str| StoredItem {
            namespace: Namespace::semantic("u1").unwrap(),
            key: category.to_string(),
            value: MemoryRecord::new("u1", MemoryType::Semantic, category, "x", 1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            score: None,
        };
        let group = vec![item("pets"), item("family"), item("pets"), item("home")];
        assert_eq!(most_frequent_category(&group, "home"), "pets");
        let group = vec![item("pets"), item("home")];
        assert_eq!(most_frequent_category(&group, "home"), "home");
    }
}
