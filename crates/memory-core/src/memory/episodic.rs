//! ============================================================================
//! Episodic Write Path - Dated summaries of what happened
//! ============================================================================
//! A per-thread gate (daily cap, turn cooldown, minute cooldown) decides
//! whether this turn captures an episode. Gate state lives in the session
//! store as a JSON blob and is read-modify-written once per turn.
//! ============================================================================

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classifier::MemoryClassifier;
use super::retention::RetentionPolicy;
use super::session::SessionKv;
use super::store::{VectorMemoryStore, DEFAULT_INDEXED_FIELDS};
use super::types::{ContextSnapshot, ConversationTurn, MemoryRecord, MemoryType, Namespace};
use crate::config::EpisodicConfig;

/// Per-thread episodic gate state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationThreadState {
    /// Owner-local date (`YYYY-MM-DD`) the daily counter belongs to
    pub day_marker: Option<String>,
    pub captures_today: u32,
    pub turns_since_last_capture: u32,
    pub last_capture_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Capture,
    DailyCapReached,
    TurnCooldown,
    MinuteCooldown,
}

impl ConversationThreadState {
    /// Count the new turn, resetting the daily counter on a new local day
    pub fn begin_turn(&mut self, today: &str) {
        if self.day_marker.as_deref() != Some(today) {
            self.day_marker = Some(today.to_string());
            self.captures_today = 0;
        }
        self.turns_since_last_capture = self.turns_since_last_capture.saturating_add(1);
    }

    /// Whether this turn may capture; a thread that never captured passes
    /// both cooldowns
    pub fn evaluate(&self, now: DateTime<Utc>, config: &EpisodicConfig) -> GateDecision {
        if self.captures_today >= config.daily_cap {
            return GateDecision::DailyCapReached;
        }
        let Some(last) = self.last_capture_time else {
            return GateDecision::Capture;
        };
        if self.turns_since_last_capture < config.turn_cooldown {
            return GateDecision::TurnCooldown;
        }
        if now - last < Duration::minutes(config.minute_cooldown) {
            return GateDecision::MinuteCooldown;
        }
        GateDecision::Capture
    }

    pub fn record_capture(&mut self, now: DateTime<Utc>) {
        self.captures_today += 1;
        self.turns_since_last_capture = 0;
        self.last_capture_time = Some(now);
    }
}

fn local_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// Owner-local calendar date, used as the gate's day marker
pub fn local_day(now: DateTime<Utc>, offset_minutes: i32) -> String {
    now.with_timezone(&local_offset(offset_minutes))
        .format("%Y-%m-%d")
        .to_string()
}

/// Human-readable date and ISO week in owner-local time
pub fn date_prefix(now: DateTime<Utc>, offset_minutes: i32) -> String {
    let local = now.with_timezone(&local_offset(offset_minutes));
    format!(
        "{} (week {})",
        local.format("%A, %B %-d, %Y"),
        local.iso_week().week()
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum EpisodicOutcome {
    Skipped(GateDecision),
    /// Summarizer found nothing worth keeping
    Empty,
    Created(MemoryRecord),
    Updated(MemoryRecord),
}

pub struct EpisodicWriter {
    store: Arc<VectorMemoryStore>,
    classifier: Arc<MemoryClassifier>,
    retention: Arc<RetentionPolicy>,
    session: Arc<dyn SessionKv>,
    config: EpisodicConfig,
}

fn gate_key(thread_id: &str) -> String {
    format!("gate:{}", thread_id)
}

impl EpisodicWriter {
    pub fn new(
        store: Arc<VectorMemoryStore>,
        classifier: Arc<MemoryClassifier>,
        retention: Arc<RetentionPolicy>,
        session: Arc<dyn SessionKv>,
        config: EpisodicConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            retention,
            session,
            config,
        }
    }

    pub async fn load_state(&self, thread_id: &str) -> Result<ConversationThreadState> {
        match self.session.get_json(&gate_key(thread_id)).await? {
            Some(raw) => Ok(serde_json::from_value(raw).unwrap_or_else(|e| {
                warn!("Resetting unreadable gate state for {}: {}", thread_id, e);
                ConversationThreadState::default()
            })),
            None => Ok(ConversationThreadState::default()),
        }
    }

    async fn save_state(&self, thread_id: &str, state: &ConversationThreadState) -> Result<()> {
        self.session
            .set_json(&gate_key(thread_id), serde_json::to_value(state)?)
            .await
    }

    /// Gate, summarize and write one turn's episode
    pub async fn process(
        &self,
        thread_id: &str,
        owner_id: &str,
        context: &ContextSnapshot,
        window: &[ConversationTurn],
    ) -> Result<EpisodicOutcome> {
        let namespace = Namespace::episodic(owner_id)?;
        let now = Utc::now();
        let offset = context
            .utc_offset_minutes
            .unwrap_or(self.config.default_utc_offset_minutes);

        let mut state = self.load_state(thread_id).await?;
        state.begin_turn(&local_day(now, offset));

        let decision = state.evaluate(now, &self.config);
        if decision != GateDecision::Capture {
            debug!("Episodic capture for {} skipped: {:?}", thread_id, decision);
            self.save_state(thread_id, &state).await?;
            return Ok(EpisodicOutcome::Skipped(decision));
        }

        let Some(episode) = self
            .classifier
            .summarize_episode(window, self.config.window_turns)
            .await?
        else {
            self.save_state(thread_id, &state).await?;
            return Ok(EpisodicOutcome::Empty);
        };

        let text = format!("{}: {}", date_prefix(now, offset), episode.summary);
        let nearest = self
            .store
            .search(&namespace, &text, None, 1, 0)
            .await?
            .into_iter()
            .next();

        let merge_window = Duration::hours(self.config.merge_window_hours);
        let outcome = match nearest {
            Some(neighbor)
                if neighbor.score.unwrap_or(0.0) >= self.config.novelty_min
                    && now - neighbor.updated_at <= merge_window =>
            {
                let mut record = neighbor.value.clone();
                let extended = format!("{} {}", record.display_summary.trim_end(), episode.summary);
                record.set_summary(&extended);
                record.display_summary = extended;
                record.importance = record.importance.max(episode.importance);
                let stored = self
                    .store
                    .put(&namespace, &neighbor.key, record, DEFAULT_INDEXED_FIELDS)
                    .await?;
                info!("Extended episode {} for {}", neighbor.key, owner_id);
                EpisodicOutcome::Updated(stored.value)
            }
            _ => {
                self.retention.ensure_capacity(&namespace).await?;
                let mut record = MemoryRecord::new(
                    owner_id,
                    MemoryType::Episodic,
                    episode.category,
                    text.clone(),
                    episode.importance,
                )
                .with_source(context.source.as_deref().unwrap_or("chat"));
                record.display_summary = text;

                let key = record.id.clone();
                let stored = self
                    .store
                    .put(&namespace, &key, record, DEFAULT_INDEXED_FIELDS)
                    .await?;
                self.retention.record_created(&namespace).await;
                info!("Captured episode {} for {}", key, owner_id);
                EpisodicOutcome::Created(stored.value)
            }
        };

        state.record_capture(now);
        self.save_state(thread_id, &state).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::memory::index::InMemoryIndex;
    use crate::memory::session::InMemorySessionStore;
    use crate::memory::testing::{store_with, ScriptedSummarizer};
    use chrono::TimeZone;

    fn config() -> EpisodicConfig {
        EpisodicConfig {
            turn_cooldown: 3,
            minute_cooldown: 10,
            daily_cap: 2,
            ..EpisodicConfig::default()
        }
    }

    #[test]
    fn test_turn_cooldown_gate() {
        let config = config();
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut state = ConversationThreadState::default();

        state.begin_turn("2026-03-02");
        assert_eq!(state.evaluate(start, &config), GateDecision::Capture);
        state.record_capture(start);

        let later = start + Duration::minutes(30);
        state.begin_turn("2026-03-02");
        assert_eq!(state.evaluate(later, &config), GateDecision::TurnCooldown);
        state.begin_turn("2026-03-02");
        assert_eq!(state.turns_since_last_capture, 2);
        assert_eq!(state.evaluate(later, &config), GateDecision::TurnCooldown);

        // Third turn with enough elapsed minutes
        state.begin_turn("2026-03-02");
        assert_eq!(state.evaluate(later, &config), GateDecision::Capture);
    }

    #[test]
    fn test_minute_cooldown_and_daily_cap() {
        let config = config();
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut state = ConversationThreadState::default();
        state.begin_turn("2026-03-02");
        state.record_capture(start);
        for _ in 0..3 {
            state.begin_turn("2026-03-02");
        }
        assert_eq!(state.evaluate(start + Duration::minutes(5), &config), GateDecision::MinuteCooldown);

        state.record_capture(start + Duration::minutes(20));
        for _ in 0..3 {
            state.begin_turn("2026-03-02");
        }
        assert_eq!(state.evaluate(start + Duration::hours(2), &config), GateDecision::DailyCapReached);

        // A new local day resets the cap
        state.begin_turn("2026-03-03");
        assert_eq!(state.captures_today, 0);
        assert_eq!(state.evaluate(start + Duration::days(1), &config), GateDecision::Capture);
    }

    #[test]
    fn test_date_prefix_uses_local_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        assert_eq!(date_prefix(now, 0), "Monday, March 2, 2026 (week 10)");
        // UTC+2 is already Tuesday
        assert_eq!(date_prefix(now, 120), "Tuesday, March 3, 2026 (week 10)");
        assert_eq!(local_day(now, -300), "2026-03-02");
    }

    fn writer(summarizer: ScriptedSummarizer, config: EpisodicConfig) -> (EpisodicWriter, Arc<VectorMemoryStore>, Arc<InMemorySessionStore>) {
        let (store, _) = store_with(InMemoryIndex::new());
        let session = Arc::new(InMemorySessionStore::new());
        let retention = Arc::new(RetentionPolicy::new(store.clone(), session.clone(), RetentionConfig::default()));
        let writer = EpisodicWriter::new(
            store.clone(),
            Arc::new(MemoryClassifier::new(Arc::new(summarizer))),
            retention,
            session.clone(),
            config,
        );
        (writer, store, session)
    }

    #[tokio::test]
    async fn test_capture_then_cooldown() {
        let summarizer = ScriptedSummarizer::new().on(
            "what happened",
            r#"{"summary": "User talked about a trip to Lisbon.", "category": "travel", "importance": 3}"#,
        );
        let (writer, store, _) = writer(summarizer, config());
        let window = vec![ConversationTurn::user("I'm going to Lisbon")];

        let first = writer.process("t1", "u1", &ContextSnapshot::default(), &window).await.unwrap();
        let EpisodicOutcome::Created(record) = first else {
            panic!("expected capture, got {:?}", first);
        };
        assert!(record.summary.ends_with("User talked about a trip to Lisbon."));
        assert!(record.summary.contains("(week "));

        let second = writer.process("t1", "u1", &ContextSnapshot::default(), &window).await.unwrap();
        assert_eq!(second, EpisodicOutcome::Skipped(GateDecision::TurnCooldown));

        let state = writer.load_state("t1").await.unwrap();
        assert_eq!(state.captures_today, 1);
        assert_eq!(state.turns_since_last_capture, 1);
        assert_eq!(store.count(&Namespace::episodic("u1").unwrap()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_similar_recent_episode_is_extended() {
        let summarizer = ScriptedSummarizer::new().on(
            "what happened",
            r#"{"summary": "User talked about a trip to Lisbon.", "category": "travel", "importance": 2}"#,
        );
        let config = EpisodicConfig {
            turn_cooldown: 0,
            minute_cooldown: 0,
            ..config()
        };
        let (writer, store, _) = writer(summarizer, config);
        let window = vec![ConversationTurn::user("Lisbon again")];

        // Different threads so each one passes its own gate
        writer.process("t1", "u1", &ContextSnapshot::default(), &window).await.unwrap();
        let second = writer.process("t2", "u1", &ContextSnapshot::default(), &window).await.unwrap();

        // Identical text embeds identically, so the second capture extends the first
        let EpisodicOutcome::Updated(record) = second else {
            panic!("expected extension, got {:?}", second);
        };
        assert!(record.display_summary.matches("Lisbon").count() >= 2);
        assert_eq!(store.count(&Namespace::episodic("u1").unwrap()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_summary_aborts_without_reset() {
        let summarizer = ScriptedSummarizer::new().on("what happened", r#"{"summary": ""}"#);
        let (writer, store, _) = writer(summarizer, config());

        let outcome = writer
            .process("t1", "u1", &ContextSnapshot::default(), &[ConversationTurn::user("ok")])
            .await
            .unwrap();
        assert_eq!(outcome, EpisodicOutcome::Empty);
        assert_eq!(writer.load_state("t1").await.unwrap().captures_today, 0);
        assert_eq!(store.count(&Namespace::episodic("u1").unwrap()).await.unwrap(), 0);
    }
}
