//! Core record model for collected channel messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tgh-core";

/// Row label written to the `Type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "text")]
    Primary,
    #[serde(rename = "comment")]
    Reply,
}

impl RecordKind {
    pub fn label(self) -> &'static str {
        match self {
            RecordKind::Primary => "text",
            RecordKind::Reply => "comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCount {
    pub emoticon: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Engagement {
    pub views: Option<i64>,
    pub shares: Option<i64>,
    /// Reaction tally in the order the source reports it.
    pub reactions: Vec<ReactionCount>,
}

/// Boundary type every source maps its native message objects into.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub post_author: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub reactions: Vec<ReactionCount>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub reply_to: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("message {id} in {group} has no timestamp")]
    MissingTimestamp { group: String, id: i64 },
}

/// One accepted message. Replies are only attached to primary records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub source_group: String,
    pub author_id: Option<i64>,
    pub author: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub sequence_id: i64,
    pub reply_anchor: Option<i64>,
    pub engagement: Engagement,
    pub has_media: bool,
    pub permalink: String,
    pub replies: Vec<Record>,
}

impl Record {
    pub fn primary(
        group: &str,
        message: &SourceMessage,
        replies: Vec<Record>,
    ) -> Result<Self, RecordError> {
        let timestamp = require_timestamp(group, message)?;
        Ok(Self {
            kind: RecordKind::Primary,
            source_group: group.to_string(),
            author_id: message.sender_id,
            author: message.post_author.clone(),
            body: sanitize_text(message.text.as_deref().unwrap_or_default()),
            timestamp,
            sequence_id: message.id,
            reply_anchor: None,
            engagement: engagement_of(message),
            has_media: message.has_media,
            permalink: channel_permalink(group, message.id),
            replies,
        })
    }

    /// Reply bodies have `'` swapped for `"` before they are nested into the comments column.
    pub fn reply(group: &str, anchor_id: i64, message: &SourceMessage) -> Result<Self, RecordError> {
        let timestamp = require_timestamp(group, message)?;
        Ok(Self {
            kind: RecordKind::Reply,
            source_group: group.to_string(),
            author_id: message.sender_id,
            author: message.post_author.clone(),
            body: sanitize_text(message.text.as_deref().unwrap_or_default()).replace('\'', "\""),
            timestamp,
            sequence_id: message.id,
            reply_anchor: Some(anchor_id),
            engagement: engagement_of(message),
            has_media: message.has_media,
            permalink: reply_permalink(group, anchor_id, message.id),
            replies: Vec::new(),
        })
    }

    pub fn formatted_date(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn require_timestamp(group: &str, message: &SourceMessage) -> Result<DateTime<Utc>, RecordError> {
    message.date.ok_or_else(|| RecordError::MissingTimestamp {
        group: group.to_string(),
        id: message.id,
    })
}

fn engagement_of(message: &SourceMessage) -> Engagement {
    Engagement {
        views: message.views,
        shares: message.forwards,
        reactions: message.reactions.clone(),
    }
}

fn is_allowed_char(c: char) -> bool {
    matches!(
        c as u32,
        0x09 | 0x0A | 0x0D | 0x20..=0xD7FF | 0xE000..=0xFFFD | 0x1_0000..=0x10_FFFF
    )
}

/// Drop characters that spreadsheet and XML based readers reject.
pub fn sanitize_text(text: &str) -> String {
    text.chars().filter(|c| is_allowed_char(*c)).collect()
}

pub fn channel_permalink(group: &str, id: i64) -> String {
    format!("https://t.me/{group}/{id}").replace('@', "")
}

pub fn reply_permalink(group: &str, anchor_id: i64, id: i64) -> String {
    format!("https://t.me/{group}/{anchor_id}?comment={id}").replace('@', "")
}

pub fn format_reactions(reactions: &[ReactionCount]) -> String {
    reactions
        .iter()
        .map(|r| format!("{} {} ", r.emoticon, r.count))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    /// Newer than `date_max`; older in-window messages may still follow.
    TooNew,
    Inside,
    /// Older than `date_min`; everything after it in newest-first order is too.
    TooOld,
}

/// Inclusive acceptance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub date_min: DateTime<Utc>,
    pub date_max: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(date_min: DateTime<Utc>, date_max: DateTime<Utc>) -> Option<Self> {
        (date_min <= date_max).then_some(Self { date_min, date_max })
    }

    pub fn classify(&self, ts: DateTime<Utc>) -> WindowPosition {
        if ts < self.date_min {
            WindowPosition::TooOld
        } else if ts > self.date_max {
            WindowPosition::TooNew
        } else {
            WindowPosition::Inside
        }
    }
}
