//! JSONL file source: one record per line, `.gz` files decompressed on the fly

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{MessageSource, RecordStream, SourceError};
use crate::record::Record;

pub struct JsonlMessageSource {
    path: PathBuf,
    name: String,
}

impl JsonlMessageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_gzip(&self) -> bool {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false)
    }
}

impl MessageSource for JsonlMessageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&mut self) -> Result<RecordStream<'_>, SourceError> {
        let file = File::open(&self.path)?;
        let reader: Box<dyn BufRead> = if self.is_gzip() {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        log::info!("📖 Reading messages from {}", self.path.display());

        let origin = self.name.clone();
        let stream = reader
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| parse_line(&origin, idx + 1, line));

        Ok(Box::new(stream))
    }
}

fn parse_line(
    origin: &str,
    line_no: usize,
    line: std::io::Result<String>,
) -> Option<Result<Record, SourceError>> {
    let line = match line {
        Ok(line) => line,
        Err(e) => return Some(Err(SourceError::Io(e))),
    };

    if line.trim().is_empty() {
        return None;
    }

    Some(Record::from_jsonl(&line).map_err(|e| SourceError::Malformed {
        origin: origin.to_string(),
        line: line_no,
        reason: e.to_string(),
    }))
}
