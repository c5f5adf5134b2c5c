//! ============================================================================
//! Write Decision Engine - One cold-path job, both write paths
//! ============================================================================
//! Runs the semantic path, then the episodic path, against the job's store.
//! Any error fails the whole job so the coordinator can retry it. Profile
//! sync and events are best-effort and timeout-bounded.
//! ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::classifier::MemoryClassifier;
use super::coordinator::{ColdPathHandler, PendingColdPathJob};
use super::decision::{SemanticOutcome, SemanticWriter};
use super::episodic::{EpisodicOutcome, EpisodicWriter};
use super::events::{MemoryEvent, ProfileSync};
use super::retention::RetentionPolicy;
use super::session::SessionKv;
use super::summarizer::Summarizer;
use super::types::MemoryRecord;
use crate::config::MemoryConfig;

/// What one job did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub semantic: Option<SemanticOutcome>,
    pub episodic: Option<EpisodicOutcome>,
}

pub struct WriteDecisionEngine {
    classifier: Arc<MemoryClassifier>,
    session: Arc<dyn SessionKv>,
    config: Arc<MemoryConfig>,
    profile_sync: Option<Arc<dyn ProfileSync>>,
}

impl WriteDecisionEngine {
    pub fn new(summarizer: Arc<dyn Summarizer>, session: Arc<dyn SessionKv>, config: Arc<MemoryConfig>) -> Self {
        Self {
            classifier: Arc::new(MemoryClassifier::new(summarizer)),
            session,
            config,
            profile_sync: None,
        }
    }

    pub fn with_profile_sync(mut self, profile_sync: Arc<dyn ProfileSync>) -> Self {
        self.profile_sync = Some(profile_sync);
        self
    }

    pub async fn process(&self, job: &PendingColdPathJob) -> Result<JobReport> {
        let retention = Arc::new(RetentionPolicy::new(
            job.store.clone(),
            self.session.clone(),
            self.config.retention.clone(),
        ));
        let source = job.context.source.as_deref().unwrap_or("chat");
        let mut report = JobReport::default();

        if self.config.semantic.enabled {
            let candidate = self
                .classifier
                .decide_trigger(&job.window, self.config.semantic.window_turns)
                .await?;

            match candidate {
                Some(candidate) => {
                    let writer = SemanticWriter::new(
                        job.store.clone(),
                        self.classifier.clone(),
                        retention.clone(),
                        self.config.semantic.clone(),
                    );
                    let outcome = writer.write(&job.owner_id, &candidate, source).await?;

                    if let Some(record) = outcome.record() {
                        self.sync_profile(&job.owner_id, record).await;
                        let event = match &outcome {
                            SemanticOutcome::Created(_) => MemoryEvent::created(&job.thread_id, record),
                            _ => MemoryEvent::updated(&job.thread_id, record),
                        };
                        job.events.emit(event).await;
                    }
                    report.semantic = Some(outcome);
                }
                None => debug!("No durable fact in thread {}", job.thread_id),
            }
        }

        if self.config.episodic.enabled {
            let writer = EpisodicWriter::new(
                job.store.clone(),
                self.classifier.clone(),
                retention,
                self.session.clone(),
                self.config.episodic.clone(),
            );
            let outcome = writer
                .process(&job.thread_id, &job.owner_id, &job.context, &job.window)
                .await?;

            match &outcome {
                EpisodicOutcome::Created(record) => {
                    job.events.emit(MemoryEvent::created(&job.thread_id, record)).await;
                }
                EpisodicOutcome::Updated(record) => {
                    job.events.emit(MemoryEvent::updated(&job.thread_id, record)).await;
                }
                _ => {}
            }
            report.episodic = Some(outcome);
        }

        Ok(report)
    }

    async fn sync_profile(&self, owner_id: &str, record: &MemoryRecord) {
        let Some(sync) = &self.profile_sync else {
            return;
        };
        let limit = Duration::from_millis(self.config.events.side_effect_timeout_ms);
        match tokio::time::timeout(limit, sync.sync(owner_id, record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Profile sync for {} failed: {}", owner_id, e),
            Err(_) => warn!("Profile sync for {} timed out after {:?}", owner_id, limit),
        }
    }
}

#[async_trait]
impl ColdPathHandler for WriteDecisionEngine {
    async fn handle(&self, job: &PendingColdPathJob) -> Result<()> {
        let report = self.process(job).await?;
        debug!("Cold path job for {} done: {:?}", job.thread_id, report);
        Ok(())
    }
}
