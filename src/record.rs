//! Chat message records as read from a source and carried through the pipeline

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;

use crate::facts::NumericFact;
use crate::sorter_core::SortKey;

/// Date layouts with an explicit UTC offset, tried after RFC 3339
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"];

/// Date layouts without an offset; interpreted as UTC
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Why a record was dropped before reaching the conversation builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingDate,
    InvalidDate(String),
    Unserializable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingDate => write!(f, "record has no date"),
            SkipReason::InvalidDate(raw) => write!(f, "unparsable date: {:?}", raw),
            SkipReason::Unserializable(e) => write!(f, "record cannot be serialized: {}", e),
        }
    }
}

/// Identity used for reply lookups.
///
/// Message ids are allocated per chat, so the group id scopes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub group_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollOption {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub voters: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    #[serde(default)]
    pub options: Vec<PollOption>,
    #[serde(default)]
    pub total_voters: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message body: plain text, a poll, or any other structured payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Poll(Poll),
    Other(Value),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Human-readable rendering used for content hashing and downstream prompts
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Content::Text(text) => Cow::Borrowed(text),
            Content::Poll(poll) => {
                let options = poll
                    .options
                    .iter()
                    .map(|opt| format!("- {} ({} votes)", opt.text, opt.voters))
                    .collect::<Vec<_>>()
                    .join("\n");
                Cow::Owned(format!(
                    "Poll: {}\n{}\nTotal Voters: {}",
                    poll.question, options, poll.total_voters
                ))
            }
            Content::Other(Value::Null) => Cow::Borrowed(""),
            Content::Other(value) => Cow::Owned(value.to_string()),
        }
    }
}

/// A single chat message.
///
/// `(id, group_id, topic_id)` identifies a record within a source. Fields the
/// pipeline does not interpret are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    #[serde(default, alias = "source_group_id")]
    pub group_id: i64,
    #[serde(default)]
    pub topic_id: Option<i64>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "deserialize_sender_id")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Content,
    #[serde(default, alias = "reply_to_msg_id")]
    pub reply_to_id: Option<i64>,
    #[serde(default)]
    pub topic_title: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub normalized_values: Vec<NumericFact>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Minimal text record, mostly useful for embedding and tests
    pub fn new(id: i64, date: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            group_id: 0,
            topic_id: None,
            date: Some(date.into()),
            sender_id: None,
            content: Content::Text(content.into()),
            reply_to_id: None,
            topic_title: None,
            source_name: None,
            normalized_values: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Parse a record from one JSONL line
    pub fn from_jsonl(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            group_id: self.group_id,
            message_id: self.id,
        }
    }

    pub fn reply_key(&self) -> Option<MessageKey> {
        self.reply_to_id.map(|message_id| MessageKey {
            group_id: self.group_id,
            message_id,
        })
    }

    pub fn timestamp(&self) -> Result<DateTime<Utc>, SkipReason> {
        match self.date.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_timestamp(raw),
            _ => Err(SkipReason::MissingDate),
        }
    }
}

impl SortKey for Record {
    fn sort_key(&self) -> Result<String, SkipReason> {
        self.timestamp().map(|ts| format_sort_key(&ts))
    }
}

/// Parse an ISO-8601 date into a UTC instant
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SkipReason> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(SkipReason::InvalidDate(raw.to_string()))
}

/// Fixed-width UTC rendering: lexical order equals chronological order
pub fn format_sort_key(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn deserialize_sender_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
