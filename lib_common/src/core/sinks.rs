//! # Alert Sinks
//!
//! Best-effort collaborators that receive every emitted violation: the
//! database store and the notifier. Dispatch spawns one task per sink and
//! never waits on it. A failing or slow sink is logged and otherwise has no
//! effect on the alert path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One alert as handed to the collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub session_id: String,
    pub missing_items: Vec<String>,
    pub track_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_height: Option<u32>,
    pub detected_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    async fn deliver(&self, record: &ViolationRecord) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct AlertSinks {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn AlertSink>) {
        log::info!("Alert sink '{}' enabled", sink.name());
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Fire-and-forget delivery to every sink. Must be called from within a
    /// Tokio runtime.
    pub fn dispatch(&self, record: ViolationRecord) {
        if self.sinks.is_empty() {
            return;
        }
        let record = Arc::new(record);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let record = Arc::clone(&record);
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&record).await {
                    log::warn!(
                        "Alert sink '{}' failed for session {}: {:#}",
                        sink.name(),
                        record.session_id,
                        e
                    );
                }
            });
        }
    }
}
