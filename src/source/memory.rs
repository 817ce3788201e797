use super::{MessageSource, RecordStream, SourceError};
use crate::record::Record;

/// Source over records already in memory
pub struct MemoryMessageSource {
    name: String,
    records: Vec<Record>,
}

impl MemoryMessageSource {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

impl MessageSource for MemoryMessageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&mut self) -> Result<RecordStream<'_>, SourceError> {
        Ok(Box::new(self.records.iter().cloned().map(Ok)))
    }
}
