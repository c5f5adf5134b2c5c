//! ============================================================================
//! Memory Config - Thresholds, limits and connection settings
//! ============================================================================
//! Sources, in order: built-in defaults → optional JSON file → environment
//! (`MEMORY_*`, `QDRANT_URL`, API keys; `.env` loaded via dotenvy).
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::retry::RetryConfig;

/// Maximum length of a memory summary, in characters
pub const SUMMARY_MAX_CHARS: usize = 280;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub store: StoreConfig,
    pub semantic: SemanticConfig,
    pub episodic: EpisodicConfig,
    pub retention: RetentionConfig,
    pub coordinator: CoordinatorConfig,
    pub consolidation: ConsolidationConfig,
    pub events: EventConfig,
    pub providers: ProviderConfig,
}

/// Vector store connection and paging limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub qdrant_url: String,
    pub collection: String,
    /// Vectors are truncated or zero-padded to this dimension
    pub embedding_dim: usize,
    pub distance: DistanceMetric,
    /// Page size used by namespace scans
    pub list_page_size: usize,
    /// Hard cap on pages fetched by a single scan
    pub max_list_pages: usize,
    /// Largest key set sent to the backend in one delete call
    pub batch_delete_chunk: usize,
    /// Records sampled by `get_random_recent_high_importance`
    pub sample_fanout: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".to_string(),
            collection: "tetsuo_memories".to_string(),
            embedding_dim: 1536,
            distance: DistanceMetric::Cosine,
            list_page_size: 100,
            max_list_pages: 50,
            batch_delete_chunk: 100,
            sample_fanout: 50,
        }
    }
}

/// Similarity metric used by the vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    Dot,
}

/// How a merge writes the combined fact back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Keep the existing key and patch it
    Update,
    /// Compose a new record under a fresh id and drop the old one
    Recreate,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "update" | "update_in_place" => Ok(MergeMode::Update),
            "recreate" => Ok(MergeMode::Recreate),
            _ => Err(format!("Unknown merge mode: {}", s)),
        }
    }
}

/// Semantic (durable fact) write path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,
    /// Best-neighbor score at or above which we merge without asking
    pub auto_update: f32,
    /// Lower bound of the band confirmed by the same-fact classifier
    pub check_low: f32,
    /// Lower bound of the lexical/numeric fallback band
    pub fallback_low: f32,
    pub fallback_enabled: bool,
    pub fallback_recency_days: i64,
    /// Categories that may use the fallback band
    pub fallback_categories: Vec<String>,
    pub merge_top_k: usize,
    pub min_importance: u8,
    pub merge_mode: MergeMode,
    /// Recent turns handed to the trigger classifier
    pub window_turns: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_update: 0.85,
            check_low: 0.70,
            fallback_low: 0.55,
            fallback_enabled: true,
            fallback_recency_days: 30,
            fallback_categories: vec![
                "personal".to_string(),
                "preference".to_string(),
                "relationship".to_string(),
                "health".to_string(),
                "work".to_string(),
            ],
            merge_top_k: 5,
            min_importance: 2,
            merge_mode: MergeMode::Update,
            window_turns: 6,
        }
    }
}

/// Episodic (what happened) write path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodicConfig {
    pub enabled: bool,
    pub daily_cap: u32,
    pub turn_cooldown: u32,
    pub minute_cooldown: i64,
    /// Turns summarized per capture
    pub window_turns: usize,
    pub novelty_min: f32,
    pub merge_window_hours: i64,
    /// Offset used when the context carries none
    pub default_utc_offset_minutes: i32,
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_cap: 6,
            turn_cooldown: 3,
            minute_cooldown: 10,
            window_turns: 8,
            novelty_min: 0.80,
            merge_window_hours: 6,
            default_utc_offset_minutes: 0,
        }
    }
}

/// Per-owner capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_semantic: usize,
    pub max_episodic: usize,
    /// Use the session KV counter instead of a full count when present
    pub cached_counter: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_semantic: 500,
            max_episodic: 200,
            cached_counter: true,
        }
    }
}

/// Cold-path worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// System-wide concurrent jobs
    pub pool_size: usize,
    pub retry: RetryConfig,
    /// Idle per-thread bookkeeping is dropped after this long
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            retry: RetryConfig::default(),
            idle_ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

/// Offline near-duplicate merge job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub threshold: f32,
    /// Neighbors fetched per record while grouping
    pub search_limit: usize,
    pub owner_page_size: usize,
    /// Upper bound on owners scanned in one run; the next run picks up after the last one
    pub max_owners: usize,
    /// Owners processed in parallel
    pub concurrency: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.90,
            search_limit: 10,
            owner_page_size: 50,
            max_owners: 10_000,
            concurrency: 4,
        }
    }
}

/// Side-channel hand-offs (events, profile sync)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub side_effect_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            enqueue_timeout_ms: 2000,
            publish_timeout_ms: 5000,
            side_effect_timeout_ms: 5000,
        }
    }
}

/// Hosted capability endpoints. Keys are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(skip)]
    pub xai_api_key: Option<String>,
    #[serde(skip)]
    pub openai_api_key: Option<String>,
    pub chat_model: String,
    pub session_db_path: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            xai_api_key: None,
            openai_api_key: None,
            chat_model: "grok-3-mini".to_string(),
            session_db_path: None,
        }
    }
}

impl MemoryConfig {
    /// Load from an optional JSON file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => {
                debug!("Loading memory config from {}", p.display());
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| anyhow!("Failed to read config {}: {}", p.display(), e))?;
                serde_json::from_str(&raw)
                    .map_err(|e| anyhow!("Failed to parse config {}: {}", p.display(), e))?
            }
            None => MemoryConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (env in production, a map in tests)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QDRANT_URL") {
            self.store.qdrant_url = url;
        }
        if let Some(collection) = lookup("MEMORY_COLLECTION") {
            self.store.collection = collection;
        }
        override_parsed(&lookup, "MEMORY_EMBEDDING_DIM", &mut self.store.embedding_dim);
        if let Some(mode) = lookup("MEMORY_MERGE_MODE") {
            match mode.parse() {
                Ok(mode) => self.semantic.merge_mode = mode,
                Err(e) => warn!("Ignoring MEMORY_MERGE_MODE: {}", e),
            }
        }
        override_parsed(&lookup, "MEMORY_AUTO_UPDATE", &mut self.semantic.auto_update);
        override_parsed(&lookup, "MEMORY_CHECK_LOW", &mut self.semantic.check_low);
        override_parsed(&lookup, "MEMORY_FALLBACK_LOW", &mut self.semantic.fallback_low);
        override_parsed(&lookup, "MEMORY_MAX_SEMANTIC", &mut self.retention.max_semantic);
        override_parsed(&lookup, "MEMORY_MAX_EPISODIC", &mut self.retention.max_episodic);
        override_parsed(&lookup, "MEMORY_POOL_SIZE", &mut self.coordinator.pool_size);
        override_parsed(&lookup, "MEMORY_CONSOLIDATION_THRESHOLD", &mut self.consolidation.threshold);
        if let Some(path) = lookup("MEMORY_SESSION_DB_PATH") {
            self.providers.session_db_path = Some(path);
        }
        if let Some(model) = lookup("MEMORY_CHAT_MODEL") {
            self.providers.chat_model = model;
        }

        self.providers.xai_api_key = lookup("XAI_API_KEY")
            .or_else(|| lookup("VITE_XAI_API_KEY"))
            .filter(|k| !k.is_empty());
        self.providers.openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
    }

    /// Retention ceiling for a memory type
    pub fn max_records(&self, memory_type: crate::memory::MemoryType) -> usize {
        match memory_type {
            crate::memory::MemoryType::Semantic => self.retention.max_semantic,
            crate::memory::MemoryType::Episodic => self.retention.max_episodic,
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring unparsable {}={}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.semantic.auto_update, 0.85);
        assert!(config.semantic.check_low < config.semantic.auto_update);
        assert!(config.semantic.fallback_low < config.semantic.check_low);
        assert_eq!(config.semantic.merge_mode, MergeMode::Update);
        assert_eq!(config.episodic.turn_cooldown, 3);
        assert_eq!(config.coordinator.retry.max_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QDRANT_URL", "http://qdrant:6334"),
            ("MEMORY_MERGE_MODE", "recreate"),
            ("MEMORY_MAX_SEMANTIC", "42"),
            ("MEMORY_AUTO_UPDATE", "not-a-number"),
            ("OPENAI_API_KEY", "sk-test"),
            ("XAI_API_KEY", ""),
        ]
        .into_iter()
        .collect();

        let mut config = MemoryConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.qdrant_url, "http://qdrant:6334");
        assert_eq!(config.semantic.merge_mode, MergeMode::Recreate);
        assert_eq!(config.retention.max_semantic, 42);
        // Unparsable values keep the default
        assert_eq!(config.semantic.auto_update, 0.85);
        assert_eq!(config.providers.openai_api_key.as_deref(), Some("sk-test"));
        assert!(config.providers.xai_api_key.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{ "semantic": { "merge_mode": "recreate" }, "retention": { "max_episodic": 7 } }"#;
        let config: MemoryConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.semantic.merge_mode, MergeMode::Recreate);
        assert_eq!(config.semantic.merge_top_k, 5);
        assert_eq!(config.retention.max_episodic, 7);
        assert_eq!(config.retention.max_semantic, 500);
    }
}
