//! Spill phase: buffer, sort, write chunk files

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tempfile::TempDir;

use super::chunk::{chunk_file_name, write_chunk};
use super::merge::SortedStream;
use super::{SortError, SortKey};
use crate::config::SorterConfig;
use crate::source::SourceError;

/// Counters for one sort run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SortStats {
    /// Records handed to the merge phase
    pub accepted: usize,
    /// Records dropped (unreadable, bad key, unserializable)
    pub skipped: usize,
    pub chunk_files: usize,
}

pub struct ExternalSorter {
    config: SorterConfig,
}

impl ExternalSorter {
    pub fn new(config: SorterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    /// Consume `input` and return its records in ascending key order.
    ///
    /// Recoverable source errors and records without a valid key are logged
    /// and dropped. A fatal source error or any IO failure aborts the sort;
    /// chunk files written so far are removed before the error is returned.
    pub fn sort<T, I>(&self, input: I) -> Result<SortedStream<T>, SortError>
    where
        T: SortKey + Serialize + DeserializeOwned,
        I: IntoIterator<Item = Result<T, SourceError>>,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let mut spill = Spill::new(&self.config);
        let mut buffer: Vec<(String, T)> = Vec::with_capacity(chunk_size.min(4096));
        let mut stats = SortStats::default();

        for item in input {
            let record = match item {
                Ok(record) => record,
                Err(e) if e.is_recoverable() => {
                    log::warn!("Skipping unreadable record: {}", e);
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => return Err(SortError::Source(e)),
            };

            let key = match record.sort_key() {
                Ok(key) => key,
                Err(reason) => {
                    log::warn!("Skipping record: {}", reason);
                    stats.skipped += 1;
                    continue;
                }
            };

            // Spill on overflow: up to `chunk_size` records stay in memory
            if buffer.len() >= chunk_size {
                spill.write(&mut buffer, &mut stats)?;
            }
            buffer.push((key, record));
        }

        if spill.is_empty() {
            // Everything fit in one buffer: plain in-memory sort, no files
            buffer.sort_by(|a, b| a.0.cmp(&b.0));
            stats.accepted += buffer.len();
            log::info!(
                "Sorted {} records in memory ({} skipped)",
                stats.accepted,
                stats.skipped
            );
            return Ok(SortedStream::in_memory(
                buffer.into_iter().map(|(_, record)| record).collect(),
                stats,
            ));
        }

        if !buffer.is_empty() {
            spill.write(&mut buffer, &mut stats)?;
        }

        let (dir, paths) = spill.into_parts()?;
        stats.chunk_files = paths.len();
        log::info!(
            "Prepared {} sorted chunk(s) from {} records ({} skipped)",
            stats.chunk_files,
            stats.accepted,
            stats.skipped
        );

        SortedStream::merge(dir, &paths, self.config.use_gzip, stats)
    }
}

/// Chunk files written so far; the directory is created on first spill
struct Spill {
    temp_root: Option<PathBuf>,
    use_gzip: bool,
    dir: Option<TempDir>,
    paths: Vec<PathBuf>,
}

impl Spill {
    fn new(config: &SorterConfig) -> Self {
        Self {
            temp_root: config.temp_dir.clone(),
            use_gzip: config.use_gzip,
            dir: None,
            paths: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn create_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("convoflow-sort-");
        match &self.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    fn write<T: Serialize>(
        &mut self,
        buffer: &mut Vec<(String, T)>,
        stats: &mut SortStats,
    ) -> Result<(), SortError> {
        buffer.sort_by(|a, b| a.0.cmp(&b.0));

        let dir = match self.dir.take() {
            Some(dir) => dir,
            None => self.create_dir()?,
        };
        let path = dir.path().join(chunk_file_name(self.paths.len(), self.use_gzip));
        self.dir = Some(dir);

        let summary = write_chunk(&path, buffer, self.use_gzip)?;
        stats.accepted += summary.written;
        stats.skipped += summary.unserializable;

        log::info!(
            "📝 Wrote sorted chunk with {} records -> {}",
            summary.written,
            path.display()
        );

        self.paths.push(path);
        buffer.clear();
        Ok(())
    }

    fn into_parts(self) -> Result<(TempDir, Vec<PathBuf>), SortError> {
        match self.dir {
            Some(dir) => Ok((dir, self.paths)),
            None => Err(SortError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no chunk directory was created",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn record(id: i64, date: &str) -> Result<Record, SourceError> {
        Ok(Record::new(id, date, format!("message {}", id)))
    }

    fn sorter(chunk_size: usize, temp_dir: &std::path::Path) -> ExternalSorter {
        ExternalSorter::new(SorterConfig {
            chunk_size,
            use_gzip: true,
            temp_dir: Some(temp_dir.to_path_buf()),
        })
    }

    fn dates(stream: SortedStream<Record>) -> Vec<String> {
        stream
            .map(|r| r.unwrap().date.unwrap())
            .collect()
    }

    fn dir_entries(path: &std::path::Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }

    #[test]
    fn test_sort_across_chunks() {
        // Test: three records, chunk size two -> two chunk files merged in order
        let temp = tempfile::tempdir().unwrap();
        let input = vec![
            record(1, "2024-01-01T00:05:00Z"),
            record(2, "2024-01-01T00:01:00Z"),
            record(3, "2024-01-01T00:03:00Z"),
        ];

        let stream = sorter(2, temp.path()).sort(input).unwrap();
        assert_eq!(stream.stats().chunk_files, 2);
        assert_eq!(stream.stats().accepted, 3);

        assert_eq!(
            dates(stream),
            vec![
                "2024-01-01T00:01:00Z",
                "2024-01-01T00:03:00Z",
                "2024-01-01T00:05:00Z"
            ]
        );
        assert_eq!(dir_entries(temp.path()), 0, "chunk directory removed after merge");
    }

    #[test]
    fn test_empty_input_creates_no_files() {
        let temp = tempfile::tempdir().unwrap();

        let stream = sorter(2, temp.path()).sort(Vec::<Result<Record, SourceError>>::new()).unwrap();
        assert_eq!(stream.stats().chunk_files, 0);
        assert_eq!(dir_entries(temp.path()), 0);
        assert_eq!(stream.count(), 0);
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let mut missing = Record::new(2, "", "no date");
        missing.date = None;
        let input = vec![
            record(1, "2024-01-01T00:02:00Z"),
            Ok(missing),
            record(3, "not a date"),
            Err(SourceError::Malformed {
                origin: "test".to_string(),
                line: 4,
                reason: "bad json".to_string(),
            }),
            record(5, "2024-01-01T00:01:00Z"),
        ];

        let stream = sorter(2, temp.path()).sort(input).unwrap();
        assert_eq!(stream.stats().skipped, 3);
        assert_eq!(stream.stats().accepted, 2);

        let ids: Vec<i64> = stream.map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![5, 1]);
    }

    #[test]
    fn test_fatal_source_error_aborts_and_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let input = vec![
            record(1, "2024-01-01T00:02:00Z"),
            record(2, "2024-01-01T00:01:00Z"),
            record(3, "2024-01-01T00:03:00Z"),
            Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "disk went away",
            ))),
        ];

        let result = sorter(2, temp.path()).sort(input);
        assert!(matches!(result, Err(SortError::Source(_))));
        assert_eq!(dir_entries(temp.path()), 0, "spilled chunks removed on failure");
    }

    #[test]
    fn test_dropping_stream_early_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let input = (0..10).map(|i| record(i, &format!("2024-01-01T00:{:02}:00Z", 59 - i)));

        let mut stream = sorter(3, temp.path()).sort(input).unwrap();
        assert_eq!(stream.stats().chunk_files, 4);
        assert_eq!(dir_entries(temp.path()), 1);

        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.id, 9);
        drop(stream);

        assert_eq!(dir_entries(temp.path()), 0);
    }

    #[test]
    fn test_in_memory_path_matches_plain_sort() {
        let temp = tempfile::tempdir().unwrap();
        let raw = vec![
            ("2024-01-01T00:03:00Z", 1),
            ("2024-01-01T00:01:00Z", 2),
            ("2024-01-01T00:03:00Z", 3),
            ("2024-01-01T00:02:00Z", 4),
        ];
        let input = raw.iter().map(|(date, id)| record(*id, date));

        let stream = sorter(100, temp.path()).sort(input).unwrap();
        assert_eq!(stream.stats().chunk_files, 0);

        let mut expected = raw.clone();
        expected.sort_by(|a, b| a.0.cmp(b.0));
        let expected_ids: Vec<i64> = expected.iter().map(|(_, id)| *id).collect();

        let ids: Vec<i64> = stream.map(|r| r.unwrap().id).collect();
        assert_eq!(ids, expected_ids);
    }

    #[test]
    fn test_ties_stable_within_chunk() {
        let temp = tempfile::tempdir().unwrap();
        let input = (1..=4).map(|id| record(id, "2024-01-01T00:00:00Z"));

        let ids: Vec<i64> = sorter(4, temp.path())
            .sort(input)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
