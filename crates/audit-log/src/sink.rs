use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_BUFFER: usize = 1024;

/// Flush buffered entries after this long without new ones.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable handle for submitting [`AuditEntry`] values to the background
/// writer.
///
/// A sink built with [`disabled`](Self::disabled) accepts entries and drops
/// them, so callers never need to branch on whether event logging is on.
#[derive(Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Open the log at `path` and spawn the writer task.
    ///
    /// The task exits after a final flush once every clone of the sink has
    /// been dropped; await the returned handle to make sure everything hit
    /// the file.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);
        let writer = AuditWriter::open(path).await?;
        let handle = tokio::spawn(run_writer_loop(writer, rx));
        Ok((Self { tx: Some(tx) }, handle))
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `entry` for writing without waiting. If the queue is full or
    /// the writer task is gone the entry is dropped with a warning.
    pub fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => tracing::warn!(
                event_type = ?entry.event_type,
                "event log queue is full; entry dropped"
            ),
            Err(mpsc::error::TrySendError::Closed(entry)) => tracing::warn!(
                event_type = ?entry.event_type,
                "event log writer has stopped; entry dropped"
            ),
        }
    }
}

async fn run_writer_loop(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let mut dirty = false;

    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(entry)) => match writer.write(&entry).await {
                Ok(()) => dirty = true,
                Err(err) => tracing::error!(%err, "failed to write event log entry"),
            },
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush event log on shutdown");
                    }
                }
                tracing::debug!(written = writer.written(), "event log writer stopped");
                return;
            }
            Err(_) if dirty => match writer.flush().await {
                Ok(()) => dirty = false,
                Err(err) => tracing::error!(%err, "periodic event log flush failed"),
            },
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditEventType, AuditSource};

    fn entry(event: AuditEventType) -> AuditEntry {
        AuditEntry::new(event, AuditSource::new("test"), serde_json::json!({}))
    }

    #[tokio::test]
    async fn final_flush_when_last_sink_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let (sink, handle) = AuditSink::start(&path).await.unwrap();
        let clone = sink.clone();
        sink.log(entry(AuditEventType::RelayStarted));
        clone.log(entry(AuditEventType::RelayStopped));
        drop(sink);
        drop(clone);
        handle.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let events: Vec<AuditEventType> = contents
            .lines()
            .map(|l| serde_json::from_str::<AuditEntry>(l).unwrap().event_type)
            .collect();
        assert_eq!(
            events,
            vec![AuditEventType::RelayStarted, AuditEventType::RelayStopped]
        );
    }

    #[tokio::test]
    async fn disabled_sink_drops_entries() {
        let sink = AuditSink::disabled();
        assert!(!sink.is_enabled());
        sink.log(entry(AuditEventType::SessionClosed));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        // Nobody drains this queue, as with a writer stuck on a slow disk.
        let (tx, mut rx) = mpsc::channel(1);
        let sink = AuditSink { tx: Some(tx) };

        sink.log(entry(AuditEventType::ConnectionOpened));
        sink.log(entry(AuditEventType::SessionClosed));

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.event_type, AuditEventType::ConnectionOpened);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_fails_for_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as the log file.
        let result = AuditSink::start(dir.path()).await;
        assert!(matches!(result, Err(AuditWriteError::OpenFile { .. })));
    }
}
