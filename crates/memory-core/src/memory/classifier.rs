//! ============================================================================
//! Memory Classifier - Prompts and parsing for write decisions
//! ============================================================================
//! Every question the write paths ask the summarizer lives here. Capability
//! errors propagate (the job is retried); malformed answers are negative.
//! ============================================================================

use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::summarizer::{parse_json_object, Summarizer};
use super::types::{clamp_importance, format_transcript, ConversationTurn};

const TRIGGER_SYSTEM: &str = "You decide whether a conversation reveals a durable fact about the user \
worth remembering long-term (identity, relationships, pets, preferences, health, work, goals). \
Ignore small talk, questions and transient states. Reply with JSON only: \
{\"store\": bool, \"category\": string, \"summary\": string, \"display_summary\": string, \
\"importance\": 1-5, \"tags\": [string], \"pinned\": bool}. \
The summary is one third-person sentence under 280 characters, e.g. \"User has a dog named Rex\".";

const SAME_FACT_SYSTEM: &str = "You compare two statements about the same user. Answer whether they \
describe the same underlying fact, where the second may refine, extend or update the first. \
Reply with JSON only: {\"same\": bool}.";

const MERGE_SYSTEM: &str = "Combine two statements about the same user fact into one concise \
third-person sentence under 280 characters. Keep every detail; prefer the newer statement when \
they conflict. Reply with JSON only: {\"summary\": string}.";

const EPISODE_SYSTEM: &str = "Summarize what happened in this conversation in one or two neutral \
sentences, written in the third person about the user. Reply with JSON only: \
{\"summary\": string, \"category\": string, \"importance\": 1-5}. \
Use an empty summary if nothing notable happened.";

const CONSOLIDATE_SYSTEM: &str = "These statements are near-duplicate memories about one user, \
oldest first. Write a single third-person sentence under 280 characters that preserves every \
detail, preferring newer statements on conflict, and rate its importance. Reply with JSON only: \
{\"summary\": string, \"importance\": 1-5}.";

/// A durable fact proposed by the trigger step
#[derive(Debug, Clone, PartialEq)]
pub struct FactCandidate {
    pub category: String,
    pub summary: String,
    pub display_summary: Option<String>,
    pub importance: u8,
    pub tags: Vec<String>,
    pub pinned: bool,
}

/// A summarized slice of conversation
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub summary: String,
    pub category: String,
    pub importance: u8,
}

#[derive(Deserialize)]
struct TriggerReply {
    #[serde(default)]
    store: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    display_summary: Option<String>,
    #[serde(default)]
    importance: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    pinned: bool,
}

#[derive(Deserialize)]
struct SameFactReply {
    #[serde(default)]
    same: bool,
}

#[derive(Deserialize)]
struct SummaryReply {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<i64>,
}

fn importance_from(raw: Option<i64>, default: u8) -> u8 {
    raw.map(|i| clamp_importance(i.clamp(0, 255) as u8))
        .unwrap_or(default)
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Structured questions over a `Summarizer`
pub struct MemoryClassifier {
    summarizer: Arc<dyn Summarizer>,
}

impl MemoryClassifier {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Does the recent window hold a durable fact?
    pub async fn decide_trigger(
        &self,
        window: &[ConversationTurn],
        window_turns: usize,
    ) -> Result<Option<FactCandidate>> {
        if window.is_empty() {
            return Ok(None);
        }
        let transcript = format_transcript(window, window_turns);
        let raw = self.summarizer.complete(TRIGGER_SYSTEM, &transcript).await?;

        let Some(reply) = parse_json_object::<TriggerReply>(&raw) else {
            debug!("Trigger reply was not JSON; treating as no fact");
            return Ok(None);
        };
        if !reply.store {
            return Ok(None);
        }
        let Some(summary) = non_empty(reply.summary) else {
            return Ok(None);
        };

        Ok(Some(FactCandidate {
            category: non_empty(reply.category)
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|| "general".to_string()),
            summary,
            display_summary: non_empty(reply.display_summary),
            importance: importance_from(reply.importance, 1),
            tags: reply.tags,
            pinned: reply.pinned,
        }))
    }

    /// Do two statements describe the same fact?
    pub async fn is_same_fact(&self, existing: &str, candidate: &str) -> Result<bool> {
        let prompt = format!("Existing: {}\nNew: {}", existing, candidate);
        let raw = self.summarizer.complete(SAME_FACT_SYSTEM, &prompt).await?;
        Ok(parse_json_object::<SameFactReply>(&raw)
            .map(|r| r.same)
            .unwrap_or(false))
    }

    /// Merged summary of two statements; `None` when the capability fails
    pub async fn merge_summaries(&self, existing: &str, candidate: &str) -> Option<String> {
        let prompt = format!("Existing: {}\nNew: {}", existing, candidate);
        match self.summarizer.complete(MERGE_SYSTEM, &prompt).await {
            Ok(raw) => parse_json_object::<SummaryReply>(&raw).and_then(|r| non_empty(r.summary)),
            Err(e) => {
                warn!("Merge summary failed, using fallback: {}", e);
                None
            }
        }
    }

    /// Neutral summary of the last `window_turns` turns; `None` if empty
    pub async fn summarize_episode(
        &self,
        window: &[ConversationTurn],
        window_turns: usize,
    ) -> Result<Option<EpisodeSummary>> {
        if window.is_empty() {
            return Ok(None);
        }
        let transcript = format_transcript(window, window_turns);
        let raw = self.summarizer.complete(EPISODE_SYSTEM, &transcript).await?;

        Ok(parse_json_object::<SummaryReply>(&raw).and_then(|reply| {
            let summary = non_empty(reply.summary)?;
            Some(EpisodeSummary {
                summary,
                category: non_empty(reply.category)
                    .map(|c| c.to_lowercase())
                    .unwrap_or_else(|| "conversation".to_string()),
                importance: importance_from(reply.importance, 2),
            })
        }))
    }

    /// One summary and importance for a duplicate group (oldest first)
    pub async fn consolidate_group(&self, summaries: &[String]) -> Option<(String, u8)> {
        let prompt = summaries
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");

        match self.summarizer.complete(CONSOLIDATE_SYSTEM, &prompt).await {
            Ok(raw) => parse_json_object::<SummaryReply>(&raw).and_then(|reply| {
                let summary = non_empty(reply.summary)?;
                Some((summary, importance_from(reply.importance, 1)))
            }),
            Err(e) => {
                warn!("Group consolidation summary failed, using fallback: {}", e);
                None
            }
        }
    }
}
