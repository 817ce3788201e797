//! Chunk files: one `{"key": .., "record": ..}` JSON object per line,
//! ascending by key, optionally gzip-compressed

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use super::SortError;

#[derive(Serialize)]
struct EntryRef<'a, T> {
    key: &'a str,
    record: &'a T,
}

#[derive(Debug, Deserialize)]
pub struct ChunkEntry<T> {
    pub key: String,
    pub record: T,
}

/// Outcome of writing one chunk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWrite {
    pub written: usize,
    pub unserializable: usize,
}

pub fn chunk_file_name(index: usize, use_gzip: bool) -> String {
    if use_gzip {
        format!("chunk_{:05}.jsonl.gz", index)
    } else {
        format!("chunk_{:05}.jsonl", index)
    }
}

/// Write `entries` (already sorted by key) to `path`.
///
/// A record that fails to serialize is dropped with a warning; any IO
/// failure is returned.
pub fn write_chunk<T: Serialize>(
    path: &Path,
    entries: &[(String, T)],
    use_gzip: bool,
) -> std::io::Result<ChunkWrite> {
    let file = File::create(path)?;

    if use_gzip {
        let mut writer = BufWriter::new(GzEncoder::new(file, Compression::fast()));
        let summary = write_lines(&mut writer, entries)?;
        let encoder = writer.into_inner().map_err(|e| e.into_error())?;
        encoder.finish()?;
        Ok(summary)
    } else {
        let mut writer = BufWriter::new(file);
        let summary = write_lines(&mut writer, entries)?;
        writer.flush()?;
        Ok(summary)
    }
}

fn write_lines<W: Write, T: Serialize>(
    writer: &mut W,
    entries: &[(String, T)],
) -> std::io::Result<ChunkWrite> {
    let mut summary = ChunkWrite::default();

    for (key, record) in entries {
        match serde_json::to_string(&EntryRef { key, record }) {
            Ok(line) => {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                summary.written += 1;
            }
            Err(e) => {
                log::warn!("Skipping record with key {} that cannot be serialized: {}", key, e);
                summary.unserializable += 1;
            }
        }
    }

    Ok(summary)
}

/// Lazy line reader over one chunk file
pub struct ChunkReader {
    lines: Lines<Box<dyn BufRead>>,
}

impl ChunkReader {
    pub fn open(path: &Path, use_gzip: bool) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn BufRead> = if use_gzip {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        Ok(Self {
            lines: reader.lines(),
        })
    }

    /// Next entry, or `None` at end of file
    pub fn next_entry<T: DeserializeOwned>(&mut self) -> Result<Option<ChunkEntry<T>>, SortError> {
        for line in self.lines.by_ref() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}
