//! Merge phase: k-way merge of sorted chunk files through a min-heap

use serde::de::DeserializeOwned;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::chunk::ChunkReader;
use super::sorter::SortStats;
use super::SortError;

/// Current head of one chunk, ordered by `(key, chunk)`
struct HeadEntry<T> {
    key: String,
    chunk: usize,
    record: T,
}

impl<T> PartialEq for HeadEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.chunk == other.chunk
    }
}

impl<T> Eq for HeadEntry<T> {}

impl<T> PartialOrd for HeadEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeadEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.chunk.cmp(&other.chunk))
    }
}

// Field order matters: readers close before the directory is removed.
struct MergeState<T> {
    readers: Vec<ChunkReader>,
    heap: BinaryHeap<Reverse<HeadEntry<T>>>,
    dir: TempDir,
}

impl<T: DeserializeOwned> MergeState<T> {
    fn pop(&mut self) -> Result<Option<T>, SortError> {
        let Some(Reverse(head)) = self.heap.pop() else {
            return Ok(None);
        };

        if let Some(entry) = self.readers[head.chunk].next_entry::<T>()? {
            self.heap.push(Reverse(HeadEntry {
                key: entry.key,
                chunk: head.chunk,
                record: entry.record,
            }));
        }

        Ok(Some(head.record))
    }
}

enum Inner<T> {
    Memory(std::vec::IntoIter<T>),
    Merge(MergeState<T>),
    Done,
}

/// Lazy, finite, non-restartable sequence of sorted records.
///
/// Yields `Err` at most once (a chunk read failure), after which the stream
/// is finished. Chunk files are deleted on exhaustion, failure or drop.
pub struct SortedStream<T> {
    inner: Inner<T>,
    stats: SortStats,
}

impl<T: DeserializeOwned> SortedStream<T> {
    pub(crate) fn in_memory(records: Vec<T>, stats: SortStats) -> Self {
        Self {
            inner: Inner::Memory(records.into_iter()),
            stats,
        }
    }

    pub(crate) fn merge(
        dir: TempDir,
        paths: &[PathBuf],
        use_gzip: bool,
        stats: SortStats,
    ) -> Result<Self, SortError> {
        let mut readers = Vec::with_capacity(paths.len());
        for path in paths {
            readers.push(ChunkReader::open(path, use_gzip)?);
        }

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (chunk, reader) in readers.iter_mut().enumerate() {
            if let Some(entry) = reader.next_entry::<T>()? {
                heap.push(Reverse(HeadEntry {
                    key: entry.key,
                    chunk,
                    record: entry.record,
                }));
            }
        }

        Ok(Self {
            inner: Inner::Merge(MergeState { readers, heap, dir }),
            stats,
        })
    }
}

impl<T> SortedStream<T> {
    pub fn stats(&self) -> SortStats {
        self.stats
    }

    /// Directory holding the chunk files while the merge is in progress
    pub fn chunk_dir(&self) -> Option<&Path> {
        match &self.inner {
            Inner::Merge(state) => Some(state.dir.path()),
            _ => None,
        }
    }

    fn close(&mut self) {
        if let Inner::Merge(state) = std::mem::replace(&mut self.inner, Inner::Done) {
            let MergeState { readers, heap, dir } = state;
            drop(readers);
            drop(heap);
            let dir_path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                log::error!("Error removing sort chunk directory {}: {}", dir_path.display(), e);
            }
        }
    }
}

impl<T: DeserializeOwned> Iterator for SortedStream<T> {
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.inner {
            Inner::Memory(records) => return records.next().map(Ok),
            Inner::Merge(state) => state.pop(),
            Inner::Done => return None,
        };

        match next {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                log::error!("Aborting merge: {}", e);
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl<T> Drop for SortedStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}
