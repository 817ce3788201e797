//! Process Data Binary - chat export to conversation envelopes
//!
//! Reads raw messages, sorts them by date on disk, groups them into
//! conversations and writes `processed_conversations.json`.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin process_data
//! ```
//!
//! ## Environment Variables
//!
//! - SOURCE_KIND - `jsonl` or `sqlite` (default: jsonl)
//! - SOURCE_PATH - Raw messages file or extractor database (default: data/raw/messages.jsonl)
//! - PROCESSED_DATA_DIR - Output and pseudonym map directory (default: data/processed)
//! - TIME_THRESHOLD_SECONDS - Max gap inside a conversation (default: 300)
//! - SESSION_WINDOW_SECONDS - Max conversation lifetime (default: 3600)
//! - MAX_ACTIVE_CONVERSATIONS - In-flight conversation budget (default: 10000)
//! - REPLY_INDEX_CAPACITY - Reply lookup budget (default: 200000)
//! - RECENT_SCAN_DEPTH - Conversations scanned per message (default: 200)
//! - SORT_CHUNK_SIZE - Records per sort chunk (default: 50000)
//! - SORT_USE_GZIP - Compress sort chunks (default: true)
//! - SORT_TEMP_DIR - Sort chunk location (default: system temp dir)
//! - RUST_LOG - Logging level (optional, default: info)

use convoflow::pipeline::{build_pipeline, open_source};
use convoflow::{PipelineConfig, ProcessedOutput};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    let output_path = config.paths.output_file();

    log::info!("🚀 Starting conversation processing");
    log::info!("   Source: {} ({})", config.source_path.display(), config.source_kind.as_str());
    log::info!("   Output: {}", output_path.display());
    log::info!("   Pseudonym map: {}", config.paths.user_map_file().display());
    log::info!(
        "   Time threshold: {}s, session window: {}s",
        config.conversation.time_threshold_secs,
        config.conversation.session_window_secs
    );
    log::info!(
        "   Budgets: {} active conversations, {} reply keys, scan depth {}",
        config.conversation.max_active,
        config.conversation.reply_index_capacity,
        config.conversation.scan_depth
    );
    log::info!(
        "   Sort chunk size: {} (gzip: {})",
        config.sorter.chunk_size,
        config.sorter.use_gzip
    );

    let mut source = open_source(&config)?;
    let mut output = ProcessedOutput::create(&output_path)?;
    let mut pipeline = build_pipeline(&config);

    let stats = pipeline.run(source.as_mut(), &mut output)?;

    log::info!(
        "✅ Done: {} conversations from {} messages ({} pseudonyms)",
        stats.conversations_written,
        stats.records_read,
        pipeline.anonymizer().len()
    );

    Ok(())
}
