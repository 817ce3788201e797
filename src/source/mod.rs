//! Message sources feeding the sorter
//!
//! A source produces records in whatever order it stores them; ordering is
//! the sorter's job. Items are `Err` when a record could not be read:
//! `Malformed` entries are skipped by the sorter, anything else aborts.

pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use jsonl::JsonlMessageSource;
pub use memory::MemoryMessageSource;
pub use sqlite::SqliteMessageSource;

use crate::record::Record;

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record, SourceError>> + 'a>;

pub trait MessageSource {
    /// Source name for logging
    fn name(&self) -> &str;

    /// Start a fresh pass over every record
    fn records(&mut self) -> Result<RecordStream<'_>, SourceError>;
}

#[derive(Debug)]
pub enum SourceError {
    Io(std::io::Error),
    Database(rusqlite::Error),
    Malformed {
        origin: String,
        line: usize,
        reason: String,
    },
}

impl SourceError {
    /// Per-record problems are skipped; storage failures are fatal
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Malformed { .. })
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err)
    }
}

impl From<rusqlite::Error> for SourceError {
    fn from(err: rusqlite::Error) -> Self {
        SourceError::Database(err)
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Io(e) => write!(f, "IO error: {}", e),
            SourceError::Database(e) => write!(f, "Database error: {}", e),
            SourceError::Malformed { origin, line, reason } => {
                write!(f, "Malformed record at {}:{}: {}", origin, line, reason)
            }
        }
    }
}

impl std::error::Error for SourceError {}
