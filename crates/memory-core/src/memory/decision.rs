//! ============================================================================
//! Semantic Write Path - Dedup/merge tiers for durable facts
//! ============================================================================
//! trigger → neighbor search → tiered resolution → merge or create.
//! Tiers over the best neighbor score S:
//!   S ≥ auto_update            merge without asking
//!   check_low ≤ S              same-fact classifier, best score first
//!   fallback_low ≤ S           allow-listed categories, recent neighbors
//!                              with lexical or numeric overlap, classified
//!   otherwise                  create (if important enough) or drop
//! ============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::classifier::{FactCandidate, MemoryClassifier};
use super::merge::{apply_update, candidate_record, compose_recreated, fallback_summary};
use super::retention::RetentionPolicy;
use super::store::{VectorMemoryStore, DEFAULT_INDEXED_FIELDS};
use super::text::{lexical_overlap, numeric_overlap};
use super::types::{MemoryRecord, MetadataFilter, Namespace, StoredItem};
use crate::config::{MergeMode, SemanticConfig};

/// Which tier picked the merge target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTier {
    Auto,
    Confirmed,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SemanticOutcome {
    Created(MemoryRecord),
    Merged {
        record: MemoryRecord,
        tier: MergeTier,
        /// Key removed by a recreate merge
        replaced: Option<String>,
    },
    /// Below the minimum importance with nothing to merge into
    Dropped,
}

impl SemanticOutcome {
    pub fn record(&self) -> Option<&MemoryRecord> {
        match self {
            SemanticOutcome::Created(record) | SemanticOutcome::Merged { record, .. } => Some(record),
            SemanticOutcome::Dropped => None,
        }
    }
}

/// Whether a low-score neighbor may go to the same-fact classifier
pub fn fallback_eligible(
    config: &SemanticConfig,
    candidate: &FactCandidate,
    neighbor: &StoredItem,
    now: DateTime<Utc>,
) -> bool {
    let Some(score) = neighbor.score else {
        return false;
    };
    if score < config.fallback_low || score >= config.check_low {
        return false;
    }
    if now - neighbor.updated_at > Duration::days(config.fallback_recency_days) {
        return false;
    }
    let existing = &neighbor.value.summary;
    lexical_overlap(existing, &candidate.summary) || numeric_overlap(existing, &candidate.summary)
}

pub struct SemanticWriter {
    store: Arc<VectorMemoryStore>,
    classifier: Arc<MemoryClassifier>,
    retention: Arc<RetentionPolicy>,
    config: SemanticConfig,
}

impl SemanticWriter {
    pub fn new(
        store: Arc<VectorMemoryStore>,
        classifier: Arc<MemoryClassifier>,
        retention: Arc<RetentionPolicy>,
        config: SemanticConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            retention,
            config,
        }
    }

    /// Find the record a candidate should merge into, if any
    pub async fn resolve_target(
        &self,
        namespace: &Namespace,
        candidate: &FactCandidate,
    ) -> Result<Option<(StoredItem, MergeTier)>> {
        let filter = MetadataFilter::new().eq("category", candidate.category.as_str());
        let mut neighbors = self
            .store
            .search(namespace, &candidate.summary, Some(&filter), self.config.merge_top_k, 0)
            .await?;
        neighbors.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .partial_cmp(&a.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let Some(best) = neighbors.first() else {
            debug!("No neighbors for candidate in {}", namespace);
            return Ok(None);
        };
        let best_score = best.score.unwrap_or(0.0);
        debug!("Best neighbor score {:.3} in {}", best_score, namespace);

        if best_score >= self.config.auto_update {
            return Ok(Some((best.clone(), MergeTier::Auto)));
        }

        for neighbor in neighbors
            .iter()
            .filter(|n| n.score.unwrap_or(0.0) >= self.config.check_low)
        {
            if self
                .classifier
                .is_same_fact(&neighbor.value.summary, &candidate.summary)
                .await?
            {
                return Ok(Some((neighbor.clone(), MergeTier::Confirmed)));
            }
        }

        let allow_listed = self
            .config
            .fallback_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&candidate.category));
        if self.config.fallback_enabled && allow_listed {
            let now = Utc::now();
            for neighbor in neighbors
                .iter()
                .filter(|n| fallback_eligible(&self.config, candidate, n, now))
            {
                if self
                    .classifier
                    .is_same_fact(&neighbor.value.summary, &candidate.summary)
                    .await?
                {
                    return Ok(Some((neighbor.clone(), MergeTier::Fallback)));
                }
            }
        }

        Ok(None)
    }

    /// Run tiers and write the result
    pub async fn write(
        &self,
        owner_id: &str,
        candidate: &FactCandidate,
        source: &str,
    ) -> Result<SemanticOutcome> {
        let namespace = Namespace::semantic(owner_id)?;

        match self.resolve_target(&namespace, candidate).await? {
            Some((target, tier)) => self.merge(&namespace, target, candidate, tier).await,
            None if candidate.importance >= self.config.min_importance => {
                self.retention.ensure_capacity(&namespace).await?;
                let record = candidate_record(owner_id, candidate, source);
                let key = record.id.clone();
                let stored = self
                    .store
                    .put(&namespace, &key, record, DEFAULT_INDEXED_FIELDS)
                    .await?;
                self.retention.record_created(&namespace).await;
                info!("Created fact {} for {}", key, owner_id);
                Ok(SemanticOutcome::Created(stored.value))
            }
            None => {
                debug!(
                    "Dropping fact with importance {} (< {})",
                    candidate.importance, self.config.min_importance
                );
                Ok(SemanticOutcome::Dropped)
            }
        }
    }

    async fn merge(
        &self,
        namespace: &Namespace,
        target: StoredItem,
        candidate: &FactCandidate,
        tier: MergeTier,
    ) -> Result<SemanticOutcome> {
        match self.config.merge_mode {
            MergeMode::Update => {
                let merged = apply_update(&target.value, candidate);
                let stored = self
                    .store
                    .put(namespace, &target.key, merged, DEFAULT_INDEXED_FIELDS)
                    .await?;
                info!("Updated fact {} ({:?} merge)", target.key, tier);
                Ok(SemanticOutcome::Merged {
                    record: stored.value,
                    tier,
                    replaced: None,
                })
            }
            MergeMode::Recreate => {
                let summary = match self
                    .classifier
                    .merge_summaries(&target.value.summary, &candidate.summary)
                    .await
                {
                    Some(summary) => summary,
                    None => fallback_summary(&target.value.summary, &candidate.summary),
                };
                let merged = compose_recreated(&target.value, candidate, &summary);
                let key = merged.id.clone();

                // Insert first so a failed delete leaves a duplicate, not a loss
                let stored = self
                    .store
                    .put(namespace, &key, merged, DEFAULT_INDEXED_FIELDS)
                    .await?;
                self.store.delete(namespace, &target.key).await?;
                info!("Recreated fact {} as {} ({:?} merge)", target.key, key, tier);
                Ok(SemanticOutcome::Merged {
                    record: stored.value,
                    tier,
                    replaced: Some(target.key),
                })
            }
        }
    }
}
