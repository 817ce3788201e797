//! Source -> sort -> normalize -> conversations -> sink, as one pull chain

use crate::anonymizer::Anonymizer;
use crate::config::{PipelineConfig, SourceKind};
use crate::conversation::ConversationBuilder;
use crate::facts::extract_numeric_facts;
use crate::output::{EnvelopeSink, PersistError};
use crate::record::Record;
use crate::sorter_core::{ExternalSorter, SortError};
use crate::source::{JsonlMessageSource, MessageSource, SourceError, SqliteMessageSource};

#[derive(Debug)]
pub enum PipelineError {
    Source(SourceError),
    Sort(SortError),
    Persist(PersistError),
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        PipelineError::Source(err)
    }
}

impl From<SortError> for PipelineError {
    fn from(err: SortError) -> Self {
        PipelineError::Sort(err)
    }
}

impl From<PersistError> for PipelineError {
    fn from(err: PersistError) -> Self {
        PipelineError::Persist(err)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Source(e) => write!(f, "Source error: {}", e),
            PipelineError::Sort(e) => write!(f, "Sort error: {}", e),
            PipelineError::Persist(e) => write!(f, "Persist error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_read: usize,
    pub records_skipped: usize,
    pub records_duplicate: usize,
    pub conversations_written: usize,
    pub chunk_files: usize,
}

pub struct ProcessingPipeline {
    sorter: ExternalSorter,
    anonymizer: Anonymizer,
    builder: ConversationBuilder,
}

impl ProcessingPipeline {
    pub fn new(sorter: ExternalSorter, anonymizer: Anonymizer, builder: ConversationBuilder) -> Self {
        Self {
            sorter,
            anonymizer,
            builder,
        }
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    /// Run one full pass of `source` into `sink`.
    ///
    /// On success the sink is finished and the pseudonym map persisted. On
    /// failure the sink is aborted, so no complete-looking output is left.
    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<PipelineStats, PipelineError>
    where
        S: MessageSource + ?Sized,
        K: EnvelopeSink + ?Sized,
    {
        log::info!(
            "🚀 Processing {} -> {} sink",
            source.name(),
            sink.backend_type()
        );

        let stats = match self.drive(source, sink) {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("❌ Pipeline aborted: {}", e);
                sink.abort();
                return Err(e);
            }
        };

        sink.finish()?;

        if let Err(e) = self.anonymizer.persist() {
            log::warn!("⚠️  Pseudonym map not saved, pseudonyms may change next run: {}", e);
        }

        log::info!("📊 Pipeline complete:");
        log::info!("   Records read: {}", stats.records_read);
        log::info!("   Records skipped: {}", stats.records_skipped);
        log::info!("   Duplicates dropped: {}", stats.records_duplicate);
        log::info!("   Sort chunk files: {}", stats.chunk_files);
        log::info!("   Conversations written: {}", stats.conversations_written);

        Ok(stats)
    }

    fn drive<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<PipelineStats, PipelineError>
    where
        S: MessageSource + ?Sized,
        K: EnvelopeSink + ?Sized,
    {
        let mut records_read = 0usize;
        let records = source.records()?.inspect(|_| records_read += 1);

        let sorted = self.sorter.sort(records)?;
        let sort_stats = sorted.stats();

        let anonymizer = &mut self.anonymizer;
        let normalized = sorted.map(move |item| item.map(|record| normalize_record(record, anonymizer)));

        let mut conversations = self.builder.process(normalized);
        let mut conversations_written = 0;
        for envelope in &mut conversations {
            sink.write_envelope(&envelope?)?;
            conversations_written += 1;
        }
        let builder_stats = conversations.stats();

        Ok(PipelineStats {
            records_read,
            records_skipped: sort_stats.skipped + builder_stats.records_skipped,
            records_duplicate: builder_stats.records_duplicate,
            conversations_written,
            chunk_files: sort_stats.chunk_files,
        })
    }
}

/// Pseudonymize the sender and attach numeric facts found in text content
pub fn normalize_record(mut record: Record, anonymizer: &mut Anonymizer) -> Record {
    if let Some(sender) = record.sender_id.take() {
        record.sender_id = Some(anonymizer.anonymize(&sender));
    }
    record.normalized_values = record
        .content
        .as_text()
        .map(extract_numeric_facts)
        .unwrap_or_default();
    record
}

/// Composition root: every long-lived component built from one config
pub fn build_pipeline(config: &PipelineConfig) -> ProcessingPipeline {
    ProcessingPipeline::new(
        ExternalSorter::new(config.sorter.clone()),
        Anonymizer::load(config.paths.user_map_file()),
        ConversationBuilder::new(config.conversation.clone()),
    )
}

pub fn open_source(config: &PipelineConfig) -> Result<Box<dyn MessageSource>, SourceError> {
    match config.source_kind {
        SourceKind::Jsonl => Ok(Box::new(JsonlMessageSource::new(&config.source_path))),
        SourceKind::Sqlite => Ok(Box::new(SqliteMessageSource::open(&config.source_path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConversationSettings, SorterConfig};
    use crate::conversation::ConversationEnvelope;
    use crate::facts::Confidence;
    use crate::source::{MemoryMessageSource, RecordStream};

    fn pipeline(dir: &std::path::Path, chunk_size: usize) -> ProcessingPipeline {
        ProcessingPipeline::new(
            ExternalSorter::new(SorterConfig {
                chunk_size,
                use_gzip: false,
                temp_dir: Some(dir.join("tmp")),
            }),
            Anonymizer::load(dir.join("user_map.json")),
            ConversationBuilder::new(ConversationSettings {
                time_threshold_secs: 600,
                session_window_secs: 3600,
                ..ConversationSettings::default()
            }),
        )
    }

    fn record(id: i64, date: &str, sender: &str, text: &str) -> Record {
        let mut record = Record::new(id, date, text);
        record.sender_id = Some(sender.to_string());
        record.topic_id = Some(1);
        record
    }

    struct FailingSource;

    impl MessageSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn records(&mut self) -> Result<RecordStream<'_>, SourceError> {
            let items = vec![
                Ok(record(1, "2024-01-01T00:00:00Z", "alice", "hi")),
                Err(SourceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "read failed",
                ))),
            ];
            Ok(Box::new(items.into_iter()))
        }
    }

    #[test]
    fn test_normalize_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut anonymizer = Anonymizer::load(dir.path().join("user_map.json"));

        let normalized = normalize_record(
            record(1, "2024-01-01T00:00:00Z", "alice", "fees went up 12%"),
            &mut anonymizer,
        );
        assert_eq!(normalized.sender_id.as_deref(), Some("User_1"));
        assert_eq!(normalized.normalized_values.len(), 1);
        assert_eq!(normalized.normalized_values[0].unit, "%");
        assert_eq!(normalized.normalized_values[0].confidence, Confidence::Medium);

        let mut anonymous = Record::new(2, "2024-01-01T00:00:00Z", "no sender");
        anonymous.sender_id = None;
        let normalized = normalize_record(anonymous, &mut anonymizer);
        assert!(normalized.sender_id.is_none());
        assert!(normalized.normalized_values.is_empty());
    }

    #[test]
    fn test_run_unordered_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MemoryMessageSource::new(
            "memory",
            vec![
                record(3, "2024-01-01T02:00:00Z", "carol", "later"),
                record(2, "2024-01-01T00:00:10Z", "bob", "reply with 5 km"),
                record(1, "2024-01-01T00:00:00Z", "alice", "first"),
                record(4, "garbage", "dave", "bad date"),
            ],
        );
        let mut sink: Vec<ConversationEnvelope> = Vec::new();

        let stats = pipeline(dir.path(), 2).run(&mut source, &mut sink).unwrap();

        assert_eq!(stats.records_read, 4);
        assert_eq!(stats.records_skipped, 1);
        assert_eq!(stats.conversations_written, 2);
        assert_eq!(stats.chunk_files, 2);

        let first: Vec<i64> = sink[0].messages.iter().map(|m| m.id).collect();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(sink[0].messages[0].sender_id.as_deref(), Some("User_1"));
        assert_eq!(sink[0].messages[1].sender_id.as_deref(), Some("User_2"));
        assert_eq!(sink[0].messages[1].normalized_values[0].span, "5 km");
        assert_eq!(sink[1].messages[0].id, 3);

        // pseudonym map persisted after a successful run
        assert!(dir.path().join("user_map.json").exists());
    }

    #[test]
    fn test_fatal_source_error_aborts_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink: Vec<ConversationEnvelope> = Vec::new();

        let result = pipeline(dir.path(), 10).run(&mut FailingSource, &mut sink);

        assert!(matches!(result, Err(PipelineError::Sort(SortError::Source(_)))));
        assert!(sink.is_empty());
        assert!(!dir.path().join("user_map.json").exists());
    }
}
