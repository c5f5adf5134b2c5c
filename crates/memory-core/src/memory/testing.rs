//! Deterministic fakes for the capability traits.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::embeddings::Embedder;
use super::events::{EventSink, MemoryEvent};
use super::index::InMemoryIndex;
use super::store::VectorMemoryStore;
use super::summarizer::Summarizer;
use crate::config::StoreConfig;

pub const TEST_DIM: usize = 64;

/// Embedder with fixed vectors for known texts and hashed ones otherwise
pub struct TableEmbedder {
    dim: usize,
    table: HashMap<String, Vec<f32>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl TableEmbedder {
    pub fn new(dim: usize) -> Self {
        let mut table = HashMap::new();
        table.insert("User has a dog".to_string(), vec![1.0, 0.0]);
        // cosine 0.86 against "User has a dog"
        table.insert("User has a dog and two cats".to_string(), vec![0.86, 0.5103]);
        Self {
            dim,
            table,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.table.insert(text.to_string(), vector);
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = match self.table.get(text) {
            Some(v) => v.clone(),
            None => (0..self.dim)
                .map(|i| {
                    let mut hasher = DefaultHasher::new();
                    (text, i).hash(&mut hasher);
                    (hasher.finish() % 2001) as f32 / 1000.0 - 1.0
                })
                .collect(),
        };
        vector.resize(self.dim, 0.0);
        vector
    }
}

#[async_trait]
impl Embedder for TableEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding service unavailable"));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Summarizer answering by the first rule whose needle appears in the prompt
pub struct ScriptedSummarizer {
    rules: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSummarizer {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, needle: &str, response: &str) -> Self {
        self.rules.lock().push((needle.to_string(), response.to_string()));
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    /// Prompts received that contain `needle`
    pub fn calls(&self, needle: &str) -> usize {
        self.prompts.lock().iter().filter(|p| p.contains(needle)).count()
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let full = format!("{}\n{}", system, prompt);
        self.prompts.lock().push(full.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("chat API error 503: unavailable"));
        }
        let rules = self.rules.lock();
        Ok(rules
            .iter()
            .find(|(needle, _)| full.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| "{}".to_string()))
    }
}

/// Sink that keeps every event
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MemoryEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<MemoryEvent> {
        self.events.lock().clone()
    }

    /// Poll until at least `n` events arrived (or two seconds pass)
    pub async fn wait_for(&self, n: usize) -> Vec<MemoryEvent> {
        for _ in 0..200 {
            if self.events.lock().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn publish(&self, event: MemoryEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

pub fn test_store_config() -> StoreConfig {
    StoreConfig {
        embedding_dim: TEST_DIM,
        ..StoreConfig::default()
    }
}

/// Store over the given index with the default table embedder
pub fn store_with(index: InMemoryIndex) -> (Arc<VectorMemoryStore>, Arc<InMemoryIndex>) {
    let index = Arc::new(index);
    let store = VectorMemoryStore::new(
        Arc::new(TableEmbedder::new(TEST_DIM)),
        index.clone(),
        test_store_config(),
    );
    (Arc::new(store), index)
}
