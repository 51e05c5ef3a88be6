//! # Webhook Notifier
//!
//! Turns violation records into a short human-readable message and POSTs it
//! to a configured webhook. Delivery goes through [`ApiClient`], so
//! transient failures are retried before the sink reports an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ky_http::ApiClient;
use crate::core::sinks::{AlertSink, ViolationRecord};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Notification<'a> {
    subject: String,
    text: String,
    session_id: &'a str,
    missing_items: &'a [String],
    detected_at: DateTime<Utc>,
}

pub struct WebhookNotifier {
    client: ApiClient,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: ApiClient::new(webhook_url, None)?,
        })
    }
}

pub fn subject(missing_items: &[String]) -> String {
    format!("[PPE Alert] Missing: {}", missing_items.join(", "))
}

fn message(record: &ViolationRecord) -> String {
    let mut text = format!(
        "Session {} has a worker missing: {}.\nTracks: {:?}\nDetected at: {}",
        record.session_id,
        record.missing_items.join(", "),
        record.track_ids,
        record.detected_at.to_rfc3339()
    );
    if let (Some(w), Some(h)) = (record.frame_width, record.frame_height) {
        text.push_str(&format!("\nFrame: {}x{}", w, h));
    }
    text
}

#[async_trait]
impl AlertSink for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, record: &ViolationRecord) -> anyhow::Result<()> {
        let notification = Notification {
            subject: subject(&record.missing_items),
            text: message(record),
            session_id: &record.session_id,
            missing_items: &record.missing_items,
            detected_at: record.detected_at,
        };
        self.client.post_json("", &notification).await?;
        log::debug!("Notification sent for session {}", record.session_id);
        Ok(())
    }
}
