//! Pipeline configuration from environment variables
//!
//! Every component also has a plain config struct with `Default`, so the
//! library can be driven without touching the environment.

use chrono::TimeDelta;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::state_manager::StatePaths;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Jsonl,
    Sqlite,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jsonl => "jsonl",
            SourceKind::Sqlite => "sqlite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => Some(SourceKind::Jsonl),
            "sqlite" => Some(SourceKind::Sqlite),
            _ => None,
        }
    }
}

/// Windowing budgets for the conversation builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSettings {
    /// Max gap between consecutive messages for time-based attachment
    pub time_threshold_secs: i64,

    /// Max lifetime of a conversation, measured from its first message
    pub session_window_secs: i64,

    /// Active conversations kept in memory before the oldest is flushed
    pub max_active: usize,

    /// Message ids remembered for reply linking
    pub reply_index_capacity: usize,

    /// Newest active conversations scanned for topic/time attachment
    pub scan_depth: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            time_threshold_secs: 300,
            session_window_secs: 3600,
            max_active: 10_000,
            reply_index_capacity: 200_000,
            scan_depth: 200,
        }
    }
}

impl ConversationSettings {
    /// `None` when the value does not fit a `TimeDelta`
    pub fn time_threshold(&self) -> Option<TimeDelta> {
        TimeDelta::try_seconds(self.time_threshold_secs)
    }

    /// `None` when the value does not fit a `TimeDelta`
    pub fn session_window(&self) -> Option<TimeDelta> {
        TimeDelta::try_seconds(self.session_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SorterConfig {
    /// Records held in memory before a sorted chunk is spilled to disk
    pub chunk_size: usize,

    /// Gzip chunk files
    pub use_gzip: bool,

    /// Parent for the chunk directory; system temp dir when `None`
    pub temp_dir: Option<PathBuf>,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50_000,
            use_gzip: true,
            temp_dir: None,
        }
    }
}

/// Where processed output and resumable state live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub processed_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            processed_dir: PathBuf::from("data/processed"),
        }
    }
}

impl PathsConfig {
    pub fn output_file(&self) -> PathBuf {
        self.processed_dir.join("processed_conversations.json")
    }

    pub fn user_map_file(&self) -> PathBuf {
        self.processed_dir.join("user_map.json")
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths {
            checkpoint: self.processed_dir.join("synthesis_checkpoint.json"),
            progress: self.processed_dir.join("synthesis_progress.json"),
            processed_hashes: self.processed_dir.join("processed_hashes.json"),
            failed_batches: self.data_dir.join("failed_batches.jsonl"),
        }
    }
}

/// Configuration for the processing runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub source_kind: SourceKind,
    pub source_path: PathBuf,
    pub paths: PathsConfig,
    pub conversation: ConversationSettings,
    pub sorter: SorterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_kind: SourceKind::Jsonl,
            source_path: PathBuf::from("data/raw/messages.jsonl"),
            paths: PathsConfig::default(),
            conversation: ConversationSettings::default(),
            sorter: SorterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SOURCE_KIND` (default: jsonl; `sqlite` reads the extractor database)
    /// - `SOURCE_PATH` (default: data/raw/messages.jsonl)
    /// - `DATA_DIR` (default: data)
    /// - `PROCESSED_DATA_DIR` (default: data/processed)
    /// - `TIME_THRESHOLD_SECONDS` (default: 300)
    /// - `SESSION_WINDOW_SECONDS` (default: 3600)
    /// - `MAX_ACTIVE_CONVERSATIONS` (default: 10000)
    /// - `REPLY_INDEX_CAPACITY` (default: 200000)
    /// - `RECENT_SCAN_DEPTH` (default: 200)
    /// - `SORT_CHUNK_SIZE` (default: 50000)
    /// - `SORT_USE_GZIP` (default: true)
    /// - `SORT_TEMP_DIR` (default: system temp dir)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an injectable variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let source_kind = match lookup("SOURCE_KIND") {
            Some(raw) => SourceKind::parse(&raw).unwrap_or_else(|| {
                log::warn!("Invalid SOURCE_KIND '{}', defaulting to jsonl", raw);
                SourceKind::Jsonl
            }),
            None => defaults.source_kind,
        };

        let paths = PathsConfig {
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.paths.data_dir),
            processed_dir: lookup("PROCESSED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.paths.processed_dir),
        };

        let conversation = ConversationSettings {
            time_threshold_secs: parse_var(&lookup, "TIME_THRESHOLD_SECONDS", defaults.conversation.time_threshold_secs)?,
            session_window_secs: parse_var(&lookup, "SESSION_WINDOW_SECONDS", defaults.conversation.session_window_secs)?,
            max_active: parse_var(&lookup, "MAX_ACTIVE_CONVERSATIONS", defaults.conversation.max_active)?,
            reply_index_capacity: parse_var(&lookup, "REPLY_INDEX_CAPACITY", defaults.conversation.reply_index_capacity)?,
            scan_depth: parse_var(&lookup, "RECENT_SCAN_DEPTH", defaults.conversation.scan_depth)?,
        };

        let sorter = SorterConfig {
            chunk_size: parse_var(&lookup, "SORT_CHUNK_SIZE", defaults.sorter.chunk_size)?,
            use_gzip: lookup("SORT_USE_GZIP")
                .map(|s| s.to_lowercase().parse::<bool>())
                .transpose()
                .map_err(|_| ConfigError::InvalidValue("SORT_USE_GZIP must be true or false".to_string()))?
                .unwrap_or(defaults.sorter.use_gzip),
            temp_dir: lookup("SORT_TEMP_DIR").map(PathBuf::from),
        };

        let config = Self {
            source_kind,
            source_path: lookup("SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_path),
            paths,
            conversation,
            sorter,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let conv = &self.conversation;

        if conv.time_threshold_secs <= 0 || conv.session_window_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "time threshold and session window must be positive".to_string(),
            ));
        }

        if conv.time_threshold().is_none() || conv.session_window().is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "time threshold and session window must be at most {}s",
                TimeDelta::MAX.num_seconds()
            )));
        }

        if conv.time_threshold_secs > conv.session_window_secs {
            return Err(ConfigError::InvalidValue(format!(
                "time threshold ({}s) cannot exceed session window ({}s)",
                conv.time_threshold_secs, conv.session_window_secs
            )));
        }

        if conv.max_active == 0 || conv.reply_index_capacity == 0 || conv.scan_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "conversation capacities must be greater than zero".to_string(),
            ));
        }

        if self.sorter.chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "SORT_CHUNK_SIZE must be greater than zero".to_string(),
            ));
        }

        if self.source_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingVariable("SOURCE_PATH".to_string()));
        }

        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", name, raw))),
        None => Ok(default),
    }
}
