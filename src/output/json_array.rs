//! Streaming JSON array output: `[`, envelopes separated by `,`, `]`

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{EnvelopeSink, PersistError};
use crate::conversation::ConversationEnvelope;

/// Writes envelopes one at a time; the full array is never held in memory
pub struct JsonArrayWriter<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonArrayWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn write(&mut self, envelope: &ConversationEnvelope) -> Result<(), PersistError> {
        let separator: &[u8] = if self.written == 0 { b"[\n" } else { b",\n" };
        self.writer.write_all(separator)?;
        serde_json::to_writer(&mut self.writer, envelope)?;
        self.written += 1;
        Ok(())
    }

    /// Close the array and hand back the underlying writer
    pub fn finish(mut self) -> Result<W, PersistError> {
        if self.written == 0 {
            self.writer.write_all(b"[")?;
        }
        self.writer.write_all(b"\n]\n")?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Processed-conversations file.
///
/// Writes go to `<path>.partial`, which is renamed onto `<path>` by
/// `finish`. Aborting, or dropping before `finish`, removes the partial file.
pub struct ProcessedOutput {
    path: PathBuf,
    partial_path: PathBuf,
    writer: Option<JsonArrayWriter<BufWriter<File>>>,
}

impl ProcessedOutput {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut partial: OsString = path.clone().into_os_string();
        partial.push(".partial");
        let partial_path = PathBuf::from(partial);

        let file = File::create(&partial_path)?;
        log::info!("📝 Writing conversations to: {}", path.display());

        Ok(Self {
            path,
            partial_path,
            writer: Some(JsonArrayWriter::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    fn closed() -> PersistError {
        PersistError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "processed output already closed",
        ))
    }
}

impl EnvelopeSink for ProcessedOutput {
    fn write_envelope(&mut self, envelope: &ConversationEnvelope) -> Result<(), PersistError> {
        self.writer.as_mut().ok_or_else(Self::closed)?.write(envelope)
    }

    fn finish(&mut self) -> Result<(), PersistError> {
        let writer = self.writer.take().ok_or_else(Self::closed)?;
        let written = writer.written();

        if let Err(e) = publish(writer, &self.partial_path, &self.path) {
            let _ = fs::remove_file(&self.partial_path);
            return Err(e);
        }

        log::info!("✅ Saved {} conversations to {}", written, self.path.display());
        Ok(())
    }

    fn abort(&mut self) {
        if self.writer.take().is_none() {
            return;
        }
        match fs::remove_file(&self.partial_path) {
            Ok(()) => log::warn!("🗑️  Discarded partial output {}", self.partial_path.display()),
            Err(e) => log::error!(
                "Error removing partial output {}: {}",
                self.partial_path.display(),
                e
            ),
        }
    }

    fn backend_type(&self) -> &'static str {
        "JSON"
    }
}

impl Drop for ProcessedOutput {
    fn drop(&mut self) {
        self.abort();
    }
}

fn publish(
    writer: JsonArrayWriter<BufWriter<File>>,
    partial_path: &Path,
    path: &Path,
) -> Result<(), PersistError> {
    let file = writer
        .finish()?
        .into_inner()
        .map_err(|e| PersistError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);

    fs::rename(partial_path, path)?;
    Ok(())
}
