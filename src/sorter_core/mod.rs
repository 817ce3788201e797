//! Sorter Core - disk-backed external sort
//!
//! Orders an unbounded record stream by a string key while holding at most
//! `chunk_size` records in memory.
//!
//! ```text
//! input ──► buffer (chunk_size) ──► sort ──► chunk_00000.jsonl.gz
//!                                   sort ──► chunk_00001.jsonl.gz
//!                                   ...
//! SortedStream: min-heap over chunk heads (key, chunk index) ──► records
//! ```
//!
//! Chunk files live in a private temp directory owned by the [`SortedStream`];
//! the directory is removed when the stream is exhausted, fails or is dropped.

pub mod chunk;
pub mod merge;
pub mod sorter;

pub use merge::SortedStream;
pub use sorter::{ExternalSorter, SortStats};

use crate::record::SkipReason;
use crate::source::SourceError;

/// Anything with an orderable string key can go through the sorter
pub trait SortKey {
    /// The key the record is ordered by; `Err` drops the record with a warning
    fn sort_key(&self) -> Result<String, SkipReason>;
}

#[derive(Debug)]
pub enum SortError {
    Io(std::io::Error),
    Corrupt(serde_json::Error),
    Source(SourceError),
}

impl From<std::io::Error> for SortError {
    fn from(err: std::io::Error) -> Self {
        SortError::Io(err)
    }
}

impl From<serde_json::Error> for SortError {
    fn from(err: serde_json::Error) -> Self {
        SortError::Corrupt(err)
    }
}

impl From<SourceError> for SortError {
    fn from(err: SourceError) -> Self {
        SortError::Source(err)
    }
}

impl std::fmt::Display for SortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortError::Io(e) => write!(f, "Sort IO error: {}", e),
            SortError::Corrupt(e) => write!(f, "Corrupt chunk file: {}", e),
            SortError::Source(e) => write!(f, "Source failed during sort: {}", e),
        }
    }
}

impl std::error::Error for SortError {}
