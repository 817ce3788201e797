use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::active::ActiveConversation;
use crate::record::{format_timestamp, Record};

/// A finished conversation, as written to the processed output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEnvelope {
    pub content_hash: String,
    pub created_at: String,
    pub source_names: Vec<String>,
    pub messages: Vec<Record>,
    pub message_count: usize,
    #[serde(default)]
    pub topic_id: Option<i64>,
    #[serde(default)]
    pub topic_title: Option<String>,
    pub start_date: String,
    pub end_date: String,
}

impl ConversationEnvelope {
    pub(crate) fn from_conversation(conversation: ActiveConversation) -> Self {
        let start_date = format_timestamp(&conversation.start());
        let end_date = format_timestamp(&conversation.last());
        let topic_id = conversation.topic_id();
        let messages = conversation.into_messages();

        let source_names: Vec<String> = messages
            .iter()
            .filter_map(|m| m.source_name.as_deref())
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .map(str::to_string)
            .collect();
        let topic_title = messages.iter().find_map(|m| m.topic_title.clone());

        Self {
            content_hash: content_hash(&messages),
            created_at: format_timestamp(&Utc::now()),
            source_names,
            message_count: messages.len(),
            messages,
            topic_id,
            topic_title,
            start_date,
            end_date,
        }
    }
}

/// Lowercase hex MD5 of the rendered contents joined by newlines
pub fn content_hash(messages: &[Record]) -> String {
    let joined = messages
        .iter()
        .map(|m| m.content.render())
        .collect::<Vec<_>>()
        .join("\n");
    format!("{:x}", md5::compute(joined.as_bytes()))
}
