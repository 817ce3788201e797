//! Dead Letters Binary - summary of failed batches awaiting retry
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin dead_letters
//! ```
//!
//! ## Environment Variables
//!
//! - DATA_DIR - Directory holding failed_batches.jsonl (default: data)
//! - PROCESSED_DATA_DIR - Directory holding checkpoint/progress files (default: data/processed)
//! - RUST_LOG - Logging level (optional, default: info)

use convoflow::{PipelineConfig, StateManager};
use std::collections::BTreeMap;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    let state = StateManager::new(config.paths.state_paths());

    log::info!("🔍 Dead-letter log: {}", state.paths().failed_batches.display());

    let batches = state.load_failed_batches();
    let progress = state.load_progress();
    let processed = state.load_processed_hashes().len();

    println!("Failed batches: {}", batches.len());
    println!("Last processed index: {}", progress);
    println!("Processed conversations: {}", processed);

    if let (Some(first), Some(last)) = (batches.first(), batches.last()) {
        println!("First failure: {}", first.timestamp);
        println!("Last failure:  {}", last.timestamp);

        let mut by_error: BTreeMap<&str, usize> = BTreeMap::new();
        for batch in &batches {
            *by_error.entry(error_kind(&batch.error)).or_default() += 1;
        }

        println!("By error:");
        for (kind, count) in by_error {
            println!("  {:>6}  {}", count, kind);
        }
    }

    Ok(())
}

/// First line of the error, truncated, so similar failures group together
fn error_kind(error: &str) -> &str {
    let line = error.lines().next().unwrap_or("").trim();
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
