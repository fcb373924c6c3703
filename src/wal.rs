//! Append-only write-ahead log of completed events.
//!
//! One UTF-8 JSON line per completed event, written once per completion,
//! after processing finishes - never before. The log is a best-effort audit
//! trail: a write failure is logged and never fails the event, and the log
//! is not a durability mechanism for undelivered work.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::event::EventRecord;

pub(crate) struct WalWriter {
    path: PathBuf,
}

impl WalWriter {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event record. Failures are logged, not raised.
    pub(crate) async fn append(&self, record: &EventRecord) {
        if let Err(err) = self.try_append(record).await {
            error!(
                path = %self.path.display(),
                event_id = %record.event_id,
                error = %err,
                "failed to append event to write-ahead log"
            );
        } else {
            debug!(
                path = %self.path.display(),
                event_id = %record.event_id,
                "event appended to write-ahead log"
            );
        }
    }

    async fn try_append(&self, record: &EventRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[tokio::test]
    async fn test_append_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::new(dir.path().join("events.jsonl"));

        let first = Event::new("First").build();
        let second = Event::new("Second").build();
        wal.append(&first.to_record()).await;
        wal.append(&second.to_record()).await;

        let contents = tokio::fs::read_to_string(wal.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: EventRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record.event_id, first.id());
        assert_eq!(record.event_type, "First");
    }

    #[tokio::test]
    async fn test_append_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::new(dir.path().join("nested/deeper/events.jsonl"));
        wal.append(&Event::new("E").build().to_record()).await;
        assert!(wal.path().exists());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_panic() {
        // A directory path cannot be opened for append; the failure must be
        // swallowed and logged.
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::new(dir.path().to_path_buf());
        wal.append(&Event::new("E").build().to_record()).await;
    }
}
