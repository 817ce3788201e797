//! # convoflow
//!
//! Streaming conversation segmentation for chat exports.
//!
//! ```text
//! MessageSource (JSONL / SQLite)
//!     ↓
//! ExternalSorter (chunk spill + k-way merge by date)
//!     ↓
//! normalize_record (pseudonymize sender, extract numeric facts)
//!     ↓
//! ConversationBuilder (reply links, topic + time windows)
//!     ↓
//! EnvelopeSink → processed_conversations.json
//! ```
//!
//! Memory is bounded by three budgets: the sort chunk size, the number of
//! active conversations and the reply index capacity. Batch consumers of the
//! output (summarization, embedding) make themselves resumable through
//! [`StateManager`].

pub mod anonymizer;
pub mod config;
pub mod conversation;
pub mod facts;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod sorter_core;
pub mod source;
pub mod state_manager;

pub use anonymizer::Anonymizer;
pub use config::{ConfigError, ConversationSettings, PathsConfig, PipelineConfig, SorterConfig};
pub use conversation::{ConversationBuilder, ConversationEnvelope};
pub use facts::{extract_numeric_facts, Confidence, NumericFact};
pub use output::{EnvelopeSink, JsonArrayWriter, PersistError, ProcessedOutput};
pub use pipeline::{build_pipeline, ProcessingPipeline, PipelineError, PipelineStats};
pub use record::{Content, MessageKey, Record, SkipReason};
pub use sorter_core::{ExternalSorter, SortError, SortKey, SortedStream};
pub use source::{JsonlMessageSource, MemoryMessageSource, MessageSource, SourceError, SqliteMessageSource};
pub use state_manager::{Checkpoint, FailedBatch, StateError, StateManager, StatePaths};
