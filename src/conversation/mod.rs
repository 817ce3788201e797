//! Conversation building
//!
//! Memory is bounded by two structures: the [`ActiveConversationSet`]
//! (at most `max_active` in-flight conversations) and the [`RecencyIndex`]
//! (at most `reply_index_capacity` message keys for reply linking).

pub mod active;
pub mod builder;
pub mod envelope;
pub mod recency;

pub use active::{ActiveConversation, ActiveConversationSet, ConversationHandle};
pub use builder::{BuilderStats, ConversationBuilder, Conversations};
pub use envelope::{content_hash, ConversationEnvelope};
pub use recency::RecencyIndex;
