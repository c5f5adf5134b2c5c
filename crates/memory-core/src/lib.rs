//! ============================================================================
//! MEMORY-CORE: Tetsuo's Long-Term Memory
//! ============================================================================
//! This crate handles everything the operator remembers between sessions:
//! - Namespace-scoped vector store over Qdrant (or an in-memory index)
//! - Per-turn write decisions: semantic dedup/merge tiers, episodic capture
//! - Retention limits with best-effort cached counters
//! - Cold-path coordinator: one write per thread, latest payload wins
//! - Offline consolidation of near-duplicate memories
//! ============================================================================

pub mod config;
pub mod error;
pub mod memory;
pub mod retry;

// Re-export main types for convenience
pub use config::MemoryConfig;
pub use error::MemoryError;
pub use memory::{
    ColdPathCoordinator, ConsolidationService, ConsolidationStats, ConversationTurn,
    ContextSnapshot, MemoryManager, MemoryRecord, MemoryType, Namespace, NamespacePattern,
    StoredItem, VectorMemoryStore,
};
