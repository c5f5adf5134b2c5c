//! ============================================================================
//! Memory Types - Data structures for long-term memory
//! ============================================================================
//! Defines memory records, namespaces, conversation turns and the context
//! assembled for prompt injection.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::text::{topic_key, truncate_chars};
use crate::config::SUMMARY_MAX_CHARS;
use crate::error::{require_id, MemoryError};

/// Extension keys maintained on every write
pub const EXTRA_TOPIC_KEY: &str = "topic_key";
pub const EXTRA_IMPORTANCE_BIN: &str = "importance_bin";

/// Kinds of memory kept per owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Durable facts about the user (name, pets, preferences, ...)
    Semantic,
    /// Dated summaries of what happened in a conversation
    Episodic,
}

impl MemoryType {
    pub const ALL: [MemoryType; 2] = [MemoryType::Semantic, MemoryType::Episodic];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Semantic => "semantic",
            MemoryType::Episodic => "episodic",
        }
    }

    /// Get the display name for this memory type
    pub fn display_name(&self) -> &'static str {
        match self {
            MemoryType::Semantic => "Fact",
            MemoryType::Episodic => "Episode",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "semantic" | "fact" => Ok(MemoryType::Semantic),
            "episodic" | "episode" => Ok(MemoryType::Episodic),
            _ => Err(MemoryError::UnknownMemoryType(s.to_string())),
        }
    }
}

/// `(owner, memory_type)` key space; every store call is scoped to one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub owner_id: String,
    pub memory_type: MemoryType,
}

impl Namespace {
    pub fn new(owner_id: impl Into<String>, memory_type: MemoryType) -> Result<Self, MemoryError> {
        let owner_id = owner_id.into();
        require_id(&owner_id, "owner_id")?;
        if owner_id.contains('/') || owner_id == "*" {
            return Err(MemoryError::InvalidNamespace(owner_id));
        }
        Ok(Self {
            owner_id,
            memory_type,
        })
    }

    pub fn semantic(owner_id: impl Into<String>) -> Result<Self, MemoryError> {
        Self::new(owner_id, MemoryType::Semantic)
    }

    pub fn episodic(owner_id: impl Into<String>) -> Result<Self, MemoryError> {
        Self::new(owner_id, MemoryType::Episodic)
    }

    /// Path form used in logs and point ids: `owner/type`
    pub fn path(&self) -> String {
        format!("{}/{}", self.owner_id, self.memory_type)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.memory_type)
    }
}

/// Namespace with optional (wildcard) components, for admin listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespacePattern {
    pub owner_id: Option<String>,
    pub memory_type: Option<MemoryType>,
}

impl NamespacePattern {
    /// Every namespace in the store
    pub fn any() -> Self {
        Self::default()
    }

    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            memory_type: None,
        }
    }

    /// Parse `owner/type` where either side may be `*`
    pub fn parse(raw: &str) -> Result<Self, MemoryError> {
        let mut parts = raw.splitn(2, '/');
        let owner = parts.next().unwrap_or("*").trim();
        let kind = parts.next().unwrap_or("*").trim();

        let owner_id = match owner {
            "" | "*" => None,
            o => Some(o.to_string()),
        };
        let memory_type = match kind {
            "" | "*" => None,
            k => Some(k.parse()?),
        };
        Ok(Self {
            owner_id,
            memory_type,
        })
    }

    pub fn matches(&self, namespace: &Namespace) -> bool {
        self.owner_id
            .as_deref()
            .map_or(true, |o| o == namespace.owner_id)
            && self
                .memory_type
                .map_or(true, |t| t == namespace.memory_type)
    }

    /// The concrete namespace, when no component is a wildcard
    pub fn exact(&self) -> Option<Namespace> {
        match (&self.owner_id, self.memory_type) {
            (Some(owner_id), Some(memory_type)) => Some(Namespace {
                owner_id: owner_id.clone(),
                memory_type,
            }),
            _ => None,
        }
    }
}

impl From<&Namespace> for NamespacePattern {
    fn from(namespace: &Namespace) -> Self {
        Self {
            owner_id: Some(namespace.owner_id.clone()),
            memory_type: Some(namespace.memory_type),
        }
    }
}

/// A single memory entry stored in the vector database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier within the namespace (also the store key)
    pub id: String,
    pub owner_id: String,
    pub memory_type: MemoryType,
    pub category: String,
    /// Canonical text, at most 280 characters
    pub summary: String,
    /// Text shown to the user; may be longer than `summary`
    pub display_summary: String,
    /// 1 (trivia) to 5 (critical)
    pub importance: u8,
    pub pinned: bool,
    pub tags: BTreeSet<String>,
    /// Where the memory came from (chat, voice, consolidation, ...)
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Derived metadata (`topic_key`, `importance_bin`, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MemoryRecord {
    /// Create a new memory record with a fresh id
    pub fn new(
        owner_id: impl Into<String>,
        memory_type: MemoryType,
        category: impl Into<String>,
        summary: impl Into<String>,
        importance: u8,
    ) -> Self {
        let now = Utc::now();
        let summary = summary.into();
        let mut record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            memory_type,
            category: category.into(),
            summary: truncate_chars(&summary, SUMMARY_MAX_CHARS),
            display_summary: summary,
            importance: clamp_importance(importance),
            pinned: false,
            tags: BTreeSet::new(),
            source: "chat".to_string(),
            created_at: now,
            last_accessed: now,
            extra: BTreeMap::new(),
        };
        record.refresh_derived();
        record
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn namespace(&self) -> Namespace {
        Namespace {
            owner_id: self.owner_id.clone(),
            memory_type: self.memory_type,
        }
    }

    /// Replace the summary, keeping the 280 character bound
    pub fn set_summary(&mut self, summary: &str) {
        self.summary = truncate_chars(summary, SUMMARY_MAX_CHARS);
    }

    /// Recompute `topic_key` and `importance_bin`
    pub fn refresh_derived(&mut self) {
        self.importance = clamp_importance(self.importance);
        self.extra.insert(
            EXTRA_TOPIC_KEY.to_string(),
            serde_json::Value::String(topic_key(&self.category, &self.summary)),
        );
        self.extra.insert(
            EXTRA_IMPORTANCE_BIN.to_string(),
            serde_json::Value::String(importance_bin(self.importance).to_string()),
        );
    }

    /// Text of the named fields joined for embedding
    pub fn indexed_text(&self, fields: &[&str]) -> String {
        fields
            .iter()
            .filter_map(|field| match *field {
                "summary" => Some(self.summary.clone()),
                "display_summary" => Some(self.display_summary.clone()),
                "category" => Some(self.category.clone()),
                "tags" => Some(self.tags.iter().cloned().collect::<Vec<_>>().join(" ")),
                other => self
                    .extra
                    .get(other)
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Value of a filterable field, for client-side filtering
    pub fn field_value(&self, field: &str) -> Option<FilterValue> {
        match field {
            "category" => Some(FilterValue::Text(self.category.clone())),
            "importance" => Some(FilterValue::Integer(self.importance as i64)),
            "pinned" => Some(FilterValue::Bool(self.pinned)),
            "source" => Some(FilterValue::Text(self.source.clone())),
            "memory_type" => Some(FilterValue::Text(self.memory_type.to_string())),
            other => self.extra.get(other).and_then(FilterValue::from_json),
        }
    }
}

pub fn clamp_importance(importance: u8) -> u8 {
    importance.clamp(1, 5)
}

pub fn importance_bin(importance: u8) -> &'static str {
    match importance {
        0..=2 => "low",
        3 => "medium",
        _ => "high",
    }
}

/// Scalar value in a metadata equality filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl FilterValue {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FilterValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(FilterValue::Integer),
            serde_json::Value::String(s) => Some(FilterValue::Text(s.clone())),
            _ => None,
        }
    }

    /// String-coerced form used by the simpler filter encoding
    pub fn as_keyword(&self) -> String {
        match self {
            FilterValue::Bool(b) => b.to_string(),
            FilterValue::Integer(i) => i.to_string(),
            FilterValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

/// Conjunction of field equality conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub conditions: BTreeMap<String, FilterValue>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Client-side evaluation; integer/bool fields also match their string form
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            match record.field_value(field) {
                Some(actual) => actual == *expected || actual.as_keyword() == expected.as_keyword(),
                None => false,
            }
        })
    }
}

/// A record as held by the store, with store-level timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub namespace: Namespace,
    pub key: String,
    pub value: MemoryRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Normalized similarity in [0, 1]; set on search results only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f32>,
}

/// A single turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Role: "user" or "assistant"
    pub role: String,
    /// Message content
    pub content: String,
    /// Unix timestamp
    pub timestamp: i64,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Render the last `max_turns` turns as a transcript
pub fn format_transcript(turns: &[ConversationTurn], max_turns: usize) -> String {
    let start = turns.len().saturating_sub(max_turns);
    turns[start..]
        .iter()
        .map(|turn| {
            let role_label = if turn.role == "user" { "User" } else { "Tetsuo" };
            format!("{}: {}", role_label, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-turn context captured with a cold-path job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Owner's offset from UTC, for local date markers
    pub utc_offset_minutes: Option<i32>,
    /// Source label stamped on created records
    pub source: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Memories retrieved for a turn, ready to inject into the system prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryContext {
    pub owner_id: String,
    pub facts: Vec<MemoryRecord>,
    pub episodes: Vec<MemoryRecord>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.episodes.is_empty()
    }

    /// Format memories for inclusion in system prompt
    pub fn format_for_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut formatted = String::from("\n<user_context>\nWhat you remember about this user:\n");

        for memory in self.facts.iter().chain(self.episodes.iter()) {
            formatted.push_str(&format!(
                "- [{}] {}\n",
                memory.memory_type.display_name(),
                memory.display_summary
            ));
        }

        formatted.push_str("</user_context>\n");
        formatted
    }
}
