//! Change-notification rendering and delivery.
//!
//! Detected changes are grouped by field into nickname, furnace and state
//! messages, chunked to the embed limits, and handed to a sink. Delivery is
//! at-least-once: the caller keeps the change records until a send pass
//! succeeds.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::models::{ChangeEntry, ChangeField};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("notification transport failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification rejected with status {status}")]
    Rejected { status: u16 },
}

/// Delivery seam. Implementations handle their own transport-level rate
/// limiting; the caller spaces consecutive sends for the shared budget.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, channel_id: &str, message: &ChannelMessage) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn field_heading(field: ChangeField) -> &'static str {
    match field {
        ChangeField::Nickname => "Nickname Changes",
        ChangeField::FurnaceLevel => "Furnace Level Changes",
        ChangeField::State => "State Changes",
    }
}

fn change_line(entry: &ChangeEntry, old: &str, new: &str) -> String {
    format!("{} ({}): {} -> {}", entry.nickname, entry.fid, old, new)
}

/// Render change entries into channel messages, grouped by field kind.
/// Each group is chunked into embeds whose descriptions stay under
/// `max_description`; overflow embeds get an `(n)` suffix. Embeds are then
/// packed `max_embeds` to a message.
pub fn render_change_messages(
    alliance_name: &str,
    entries: &[ChangeEntry],
    max_embeds: usize,
    max_description: usize,
) -> Vec<ChannelMessage> {
    let mut embeds: Vec<Embed> = Vec::new();

    for field in [ChangeField::Nickname, ChangeField::FurnaceLevel, ChangeField::State] {
        let lines: Vec<String> = entries
            .iter()
            .flat_map(|entry| {
                entry
                    .changes
                    .iter()
                    .filter(|change| change.field == field)
                    .map(|change| change_line(entry, &change.old, &change.new))
            })
            .collect();
        if lines.is_empty() {
            continue;
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        for line in lines {
            // +1 for the joining newline.
            if !current.is_empty() && current.len() + line.len() + 1 > max_description {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&line);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let base_title = format!("{} [{}]", field_heading(field), alliance_name);
        for (i, description) in chunks.into_iter().enumerate() {
            let title = if i == 0 {
                base_title.clone()
            } else {
                format!("{} ({})", base_title, i + 1)
            };
            embeds.push(Embed { title, description });
        }
    }

    embeds
        .chunks(max_embeds.max(1))
        .map(|chunk| ChannelMessage {
            embeds: chunk.to_vec(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Posts messages to a notification relay endpoint as JSON.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("frostwarden/1.0")
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            url: url.into(),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    channel_id: &'a str,
    embeds: &'a [Embed],
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, channel_id: &str, message: &ChannelMessage) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&WebhookPayload {
                channel_id,
                embeds: &message.embeds,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Headless sink: logs instead of delivering. Used when no relay endpoint
/// is configured.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn send(&self, channel_id: &str, message: &ChannelMessage) -> Result<(), SinkError> {
        info!(
            channel_id,
            embeds = message.embeds.len(),
            "Notification (no sink configured)"
        );
        Ok(())
    }
}
