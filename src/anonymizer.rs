//! Stable sender pseudonyms (`User_<n>`) persisted across runs

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::state_manager::{write_json_atomic, StateError};

const PREFIX: &str = "User_";

pub struct Anonymizer {
    path: PathBuf,
    map: HashMap<String, String>,
    next_user_num: u64,
}

impl Anonymizer {
    /// Load the pseudonym map at `path`.
    ///
    /// A missing file starts empty. So does an unreadable or corrupt one,
    /// with a warning: anonymization never blocks the pipeline.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = Self::read_map(&path);

        let next_user_num = map
            .values()
            .filter_map(|pseudonym| pseudonym.strip_prefix(PREFIX)?.parse::<u64>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);

        log::info!(
            "👤 Loaded {} pseudonyms from {} (next: {}{})",
            map.len(),
            path.display(),
            PREFIX,
            next_user_num
        );

        Self {
            path,
            map,
            next_user_num,
        }
    }

    fn read_map(path: &Path) -> HashMap<String, String> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                log::warn!("⚠️  Cannot read user map {}: {}", path.display(), e);
                return HashMap::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!(
                "⚠️  Corrupt user map {}, starting with an empty map: {}",
                path.display(),
                e
            );
            HashMap::new()
        })
    }

    /// Pseudonym for `raw_id`, allocating the next number on first sight
    pub fn anonymize(&mut self, raw_id: &str) -> String {
        if let Some(pseudonym) = self.map.get(raw_id) {
            return pseudonym.clone();
        }

        let pseudonym = format!("{}{}", PREFIX, self.next_user_num);
        self.next_user_num += 1;
        self.map.insert(raw_id.to_string(), pseudonym.clone());
        pseudonym
    }

    /// Write the full map back to its file
    pub fn persist(&self) -> Result<(), StateError> {
        write_json_atomic(&self.path, &self.map)?;
        log::info!("💾 Saved {} pseudonyms to {}", self.map.len(), self.path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn next_user_num(&self) -> u64 {
        self.next_user_num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
