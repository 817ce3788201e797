//! Persistence of conversation envelopes

pub mod json_array;

pub use json_array::{JsonArrayWriter, ProcessedOutput};

use crate::conversation::ConversationEnvelope;

#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Io(err)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serialization(err)
    }
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "IO error: {}", e),
            PersistError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for PersistError {}

/// Destination for finished conversations
pub trait EnvelopeSink {
    /// Write one envelope
    fn write_envelope(&mut self, envelope: &ConversationEnvelope) -> Result<(), PersistError>;

    /// Complete the output; nothing may be written afterwards
    fn finish(&mut self) -> Result<(), PersistError>;

    /// Throw away everything written so far after a fatal error
    fn abort(&mut self) {}

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

impl EnvelopeSink for Vec<ConversationEnvelope> {
    fn write_envelope(&mut self, envelope: &ConversationEnvelope) -> Result<(), PersistError> {
        self.push(envelope.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PersistError> {
        Ok(())
    }

    fn abort(&mut self) {
        self.clear();
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
