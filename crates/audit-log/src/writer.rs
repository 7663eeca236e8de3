use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::entry::AuditEntry;

#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create directory for {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open event log {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write event log: {0}")]
    Io(#[source] std::io::Error),
}

/// Buffered JSON-lines appender.
pub struct AuditWriter {
    file: BufWriter<tokio::fs::File>,
    written: u64,
}

impl AuditWriter {
    /// Open `path` for appending, creating it and its parent directories as
    /// needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditWriteError::CreateDir {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| AuditWriteError::OpenFile {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append `entry` as one newline-terminated JSON object. Data may stay in
    /// the buffer until [`flush`](Self::flush).
    pub async fn write(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line).await.map_err(AuditWriteError::Io)?;
        self.written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(AuditWriteError::Io)
    }

    /// Number of entries written since the file was opened.
    pub fn written(&self) -> u64 {
        self.written
    }
}
