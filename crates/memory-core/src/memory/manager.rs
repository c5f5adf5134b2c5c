//! ============================================================================
//! Memory Manager - Process-wide entry point to the memory engine
//! ============================================================================
//! Built once at startup and shared by reference. Owns the store, the
//! cold-path coordinator, the consolidation service and the event publisher.
//! Hot-path callers only ever enqueue; all writes happen on the cold path.
//! ============================================================================

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use super::consolidation::{ConsolidationService, ConsolidationStats};
use super::coordinator::{ColdPathCoordinator, CoordinatorStats, PendingColdPathJob};
use super::embeddings::{create_embedding_service, Embedder};
use super::engine::WriteDecisionEngine;
use super::events::{EventPublisher, EventSink, ProfileSync, TracingEventSink};
use super::index::VectorIndex;
use super::qdrant::QdrantIndex;
use super::retention::RetentionPolicy;
use super::session::{RedbSessionStore, SessionKv};
use super::store::{VectorMemoryStore, DEFAULT_INDEXED_FIELDS};
use super::summarizer::{create_summarizer, Summarizer};
use super::types::{
    ContextSnapshot, ConversationTurn, MemoryContext, MemoryRecord, MemoryType, MetadataFilter, Namespace,
    NamespacePattern, StoredItem,
};
use crate::config::MemoryConfig;
use crate::error::{require_id, MemoryError};

/// Facts retrieved into a prompt context
const CONTEXT_FACTS: usize = 5;
/// Most recent episodes retrieved into a prompt context
const CONTEXT_EPISODES: usize = 3;

/// Capability implementations the engine runs on
pub struct Capabilities {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub summarizer: Arc<dyn Summarizer>,
    pub session: Arc<dyn SessionKv>,
    pub events: Arc<dyn EventSink>,
    pub profile_sync: Option<Arc<dyn ProfileSync>>,
}

pub struct MemoryManager {
    config: Arc<MemoryConfig>,
    store: Arc<VectorMemoryStore>,
    retention: RetentionPolicy,
    coordinator: ColdPathCoordinator,
    consolidation: ConsolidationService,
    events: EventPublisher,
}

impl MemoryManager {
    /// Connect to the hosted embedding and chat APIs, Qdrant and the local
    /// session database
    pub async fn connect(config: MemoryConfig) -> Result<Self> {
        let providers = &config.providers;
        let embedder = create_embedding_service(providers.xai_api_key.clone(), providers.openai_api_key.clone())?
            .with_dimension(config.store.embedding_dim);
        let summarizer = create_summarizer(
            providers.xai_api_key.clone(),
            providers.openai_api_key.clone(),
            &providers.chat_model,
        )?;
        let index = QdrantIndex::connect(&config.store).await?;
        let session = RedbSessionStore::open(providers.session_db_path.as_deref())?;

        info!(
            "Memory engine connected (qdrant {}, session db {})",
            config.store.qdrant_url,
            session.path().display()
        );

        Ok(Self::from_parts(
            config,
            Capabilities {
                embedder: Arc::new(embedder),
                index: Arc::new(index),
                summarizer: Arc::new(summarizer),
                session: Arc::new(session),
                events: Arc::new(TracingEventSink),
                profile_sync: None,
            },
        ))
    }

    /// Assemble the engine from explicit capabilities. Must run inside a
    /// tokio runtime.
    pub fn from_parts(config: MemoryConfig, parts: Capabilities) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(VectorMemoryStore::new(parts.embedder, parts.index, config.store.clone()));

        let mut engine = WriteDecisionEngine::new(parts.summarizer.clone(), parts.session.clone(), config.clone());
        if let Some(sync) = parts.profile_sync {
            engine = engine.with_profile_sync(sync);
        }
        let coordinator = ColdPathCoordinator::new(Arc::new(engine), config.coordinator.clone());

        let consolidation_retention = Arc::new(RetentionPolicy::new(
            store.clone(),
            parts.session.clone(),
            config.retention.clone(),
        ));
        let consolidation = ConsolidationService::new(
            store.clone(),
            parts.summarizer,
            consolidation_retention,
            config.consolidation.clone(),
        );

        Self {
            retention: RetentionPolicy::new(store.clone(), parts.session, config.retention.clone()),
            events: EventPublisher::spawn(parts.events, &config.events),
            config,
            store,
            coordinator,
            consolidation,
        }
    }

    /// Hand a turn to the cold path. Returns immediately; a newer submission
    /// for the same thread replaces one that has not started yet.
    pub fn submit_turn(
        &self,
        thread_id: &str,
        owner_id: &str,
        context: ContextSnapshot,
        window: Vec<ConversationTurn>,
    ) -> Result<(), MemoryError> {
        self.submit_turn_with_store(thread_id, owner_id, context, window, self.store.clone())
    }

    /// Like `submit_turn`, against a caller-supplied store
    pub fn submit_turn_with_store(
        &self,
        thread_id: &str,
        owner_id: &str,
        context: ContextSnapshot,
        window: Vec<ConversationTurn>,
        store: Arc<VectorMemoryStore>,
    ) -> Result<(), MemoryError> {
        require_id(thread_id, "thread_id")?;
        require_id(owner_id, "owner_id")?;

        debug!("Submitting {} turns for thread {}", window.len(), thread_id);
        self.coordinator.submit(PendingColdPathJob {
            thread_id: thread_id.to_string(),
            owner_id: owner_id.to_string(),
            context,
            window,
            store,
            events: self.events.clone(),
        });
        Ok(())
    }

    /// Direct write; a new key goes through retention first
    pub async fn put(&self, namespace: &Namespace, key: &str, record: MemoryRecord) -> Result<StoredItem> {
        let is_new = self.store.get(namespace, key).await?.is_none();
        if is_new {
            self.retention.ensure_capacity(namespace).await?;
        }
        let item = self.store.put(namespace, key, record, DEFAULT_INDEXED_FIELDS).await?;
        if is_new {
            self.retention.record_created(namespace).await;
        }
        Ok(item)
    }

    pub async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<StoredItem>> {
        self.store.get(namespace, key).await
    }

    /// Delete one record; returns whether it existed
    pub async fn delete(&self, namespace: &Namespace, key: &str) -> Result<bool> {
        if self.store.get(namespace, key).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(namespace, key).await?;
        self.retention.record_deleted(namespace, 1).await;
        Ok(true)
    }

    pub async fn list(&self, pattern: &NamespacePattern, limit: Option<usize>) -> Result<Vec<StoredItem>> {
        self.store.list_by_namespace(pattern, limit).await
    }

    pub async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        filter: Option<&MetadataFilter>,
        limit: usize,
    ) -> Result<Vec<StoredItem>> {
        self.store.search(namespace, query, filter, limit, 0).await
    }

    /// Number of records in a namespace (read through the cached counter)
    pub async fn count(&self, namespace: &Namespace) -> Result<usize> {
        self.retention.current_count(namespace).await
    }

    pub async fn run_consolidation(
        &self,
        owner_id: Option<&str>,
        memory_type: Option<MemoryType>,
    ) -> Result<ConsolidationStats> {
        self.consolidation.run(owner_id, memory_type).await
    }

    /// Memories relevant to `current_message`, ready for prompt injection.
    ///
    /// Facts come from a similarity search (or the highest-importance facts
    /// when the message is empty); episodes are the most recent ones.
    pub async fn build_context(&self, owner_id: &str, current_message: &str) -> Result<MemoryContext> {
        let semantic = Namespace::new(owner_id, MemoryType::Semantic)?;
        let episodic = Namespace::new(owner_id, MemoryType::Episodic)?;

        let facts = if current_message.trim().is_empty() {
            let mut items = self.store.list_by_namespace(&NamespacePattern::from(&semantic), None).await?;
            items.sort_by(|a, b| {
                b.value
                    .importance
                    .cmp(&a.value.importance)
                    .then_with(|| b.value.last_accessed.cmp(&a.value.last_accessed))
            });
            items
        } else {
            self.store
                .search(&semantic, current_message, None, CONTEXT_FACTS, 0)
                .await?
        };

        let mut episodes = self.store.list_by_namespace(&NamespacePattern::from(&episodic), None).await?;
        episodes.sort_by(|a, b| b.value.last_accessed.cmp(&a.value.last_accessed));

        Ok(MemoryContext {
            owner_id: owner_id.to_string(),
            facts: facts.into_iter().take(CONTEXT_FACTS).map(|i| i.value).collect(),
            episodes: episodes.into_iter().take(CONTEXT_EPISODES).map(|i| i.value).collect(),
        })
    }

    /// Resolve once the cold path has drained
    pub async fn wait_idle(&self) {
        self.coordinator.wait_idle().await
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn store(&self) -> Arc<VectorMemoryStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}
