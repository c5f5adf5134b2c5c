//! ============================================================================
//! Memory Module - Long-term memory for Tetsuo
//! ============================================================================
//! Namespace-scoped vector memory with cold-path write decisions.
//!
//! ## Architecture
//! ```text
//! submit_turn → ColdPathCoordinator (one slot per thread, latest wins)
//!                        ↓
//!              WriteDecisionEngine
//!              ├─ semantic: trigger → dedup tiers → create | merge
//!              └─ episodic: gate → summarize → create | extend
//!                        ↓
//!     RetentionPolicy → VectorMemoryStore → VectorIndex (Qdrant)
//!
//! ConsolidationService → VectorMemoryStore   (offline, per owner)
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use memory_core::{MemoryConfig, MemoryManager};
//!
//! let manager = MemoryManager::connect(MemoryConfig::load(None)?).await?;
//! manager.submit_turn("thread-1", "u1", ContextSnapshot::default(), window)?;
//! let context = manager.build_context("u1", "what pets do I have?").await?;
//! ```
//! ============================================================================

mod classifier;
mod consolidation;
mod coordinator;
mod decision;
mod embeddings;
mod engine;
mod episodic;
mod events;
mod index;
mod manager;
mod merge;
mod qdrant;
mod retention;
mod session;
mod store;
mod summarizer;
mod text;
mod types;

#[cfg(test)]
mod testing;

// Re-export public types
pub use classifier::{EpisodeSummary, FactCandidate, MemoryClassifier};
pub use consolidation::{ConsolidationService, ConsolidationStats, OwnerError};
pub use coordinator::{ColdPathCoordinator, ColdPathHandler, CoordinatorStats, PendingColdPathJob};
pub use decision::{MergeTier, SemanticOutcome, SemanticWriter};
pub use embeddings::{create_embedding_service, fit_dimension, Embedder, EmbeddingService};
pub use engine::{JobReport, WriteDecisionEngine};
pub use episodic::{ConversationThreadState, EpisodicOutcome, EpisodicWriter, GateDecision};
pub use events::{EventKind, EventPublisher, EventSink, MemoryEvent, ProfileSync, TracingEventSink};
pub use index::{FilterEncoding, InMemoryIndex, IndexDocument, IndexPage, IndexQuery, ScoredDocument, VectorIndex};
pub use manager::{Capabilities, MemoryManager};
pub use qdrant::QdrantIndex;
pub use retention::RetentionPolicy;
pub use session::{InMemorySessionStore, RedbSessionStore, SessionKv};
pub use store::{normalize_score, BatchDeleteReport, OwnerPage, VectorMemoryStore, DEFAULT_INDEXED_FIELDS};
pub use summarizer::{create_summarizer, ChatSummarizer, Summarizer};
pub use types::{
    ContextSnapshot, ConversationTurn, FilterValue, MemoryContext, MemoryRecord, MemoryType, MetadataFilter,
    Namespace, NamespacePattern, StoredItem,
};
