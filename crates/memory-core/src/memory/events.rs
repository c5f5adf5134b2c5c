//! ============================================================================
//! Memory Events - Fire-and-forget mutation notifications
//! ============================================================================
//! Jobs push events into a bounded channel; a dedicated task forwards them to
//! the sink. Enqueue and publish are both timeout-bounded and failures are
//! logged, never returned.
//! ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{MemoryRecord, MemoryType};
use crate::config::EventConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Error,
}

/// Notification keyed by conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub thread_id: String,
    pub kind: EventKind,
    pub memory_type: Option<MemoryType>,
    pub key: Option<String>,
    pub summary: Option<String>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn created(thread_id: &str, record: &MemoryRecord) -> Self {
        Self::mutation(thread_id, EventKind::Created, record)
    }

    pub fn updated(thread_id: &str, record: &MemoryRecord) -> Self {
        Self::mutation(thread_id, EventKind::Updated, record)
    }

    pub fn error(thread_id: &str, message: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            kind: EventKind::Error,
            memory_type: None,
            key: None,
            summary: None,
            message: Some(message.into()),
            at: Utc::now(),
        }
    }

    fn mutation(thread_id: &str, kind: EventKind, record: &MemoryRecord) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            kind,
            memory_type: Some(record.memory_type),
            key: Some(record.id.clone()),
            summary: Some(record.display_summary.clone()),
            message: None,
            at: Utc::now(),
        }
    }
}

/// Downstream event consumer
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: MemoryEvent) -> Result<()>;
}

/// Sink that writes events to the log
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: MemoryEvent) -> Result<()> {
        match event.kind {
            EventKind::Error => warn!(
                "Memory event [{}] error: {}",
                event.thread_id,
                event.message.as_deref().unwrap_or("")
            ),
            kind => info!(
                "Memory event [{}] {:?} {}: {}",
                event.thread_id,
                kind,
                event.key.as_deref().unwrap_or("-"),
                event.summary.as_deref().unwrap_or("")
            ),
        }
        Ok(())
    }
}

/// External profile store updated after semantic writes
#[async_trait]
pub trait ProfileSync: Send + Sync {
    async fn sync(&self, owner_id: &str, record: &MemoryRecord) -> Result<()>;
}

/// Handle to the publisher task; cheap to clone
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<MemoryEvent>,
    enqueue_timeout: Duration,
}

impl EventPublisher {
    /// Spawn the publisher task; it exits once every handle is dropped
    pub fn spawn(sink: Arc<dyn EventSink>, config: &EventConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<MemoryEvent>(config.channel_capacity.max(1));
        let publish_timeout = Duration::from_millis(config.publish_timeout_ms);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let thread_id = event.thread_id.clone();
                match tokio::time::timeout(publish_timeout, sink.publish(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Event publish for {} failed: {}", thread_id, e),
                    Err(_) => warn!("Event publish for {} timed out", thread_id),
                }
            }
            debug!("Event publisher stopped");
        });

        Self {
            tx,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        }
    }

    /// Enqueue an event; returns false if it was dropped
    pub async fn emit(&self, event: MemoryEvent) -> bool {
        match tokio::time::timeout(self.enqueue_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                warn!("Event publisher is gone; dropping event");
                false
            }
            Err(_) => {
                warn!("Event channel full; dropping event");
                false
            }
        }
    }
}
