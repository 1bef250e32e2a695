//! Append-only log backing one message type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use warden_primitives::Message;

use crate::QueueResult;

/// One persisted queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QueueRecord {
    /// Monotone, dense per type.
    pub seq: i64,
    /// The enqueued message.
    pub message: Message,
}

/// A single line in the log file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Push(QueueRecord),
    Ack { seqs: Vec<i64> },
}

/// Compaction kicks in once this many acked rows linger in the file and
/// they outnumber the pending ones.
const COMPACT_THRESHOLD: usize = 1024;

/// Durable newline-delimited JSON log for one message type.
///
/// Writes are flushed and synced before returning; replaying the file
/// rebuilds the pending set (pushes minus acks) in sequence order.
pub(crate) struct TypeLog {
    path: PathBuf,
    file: File,
    acked_rows: usize,
}

impl TypeLog {
    /// Opens (or creates) the log and replays its contents.
    ///
    /// Returns the log handle, the pending records in FIFO order, and the
    /// next sequence number to assign.
    pub(crate) async fn open(path: impl Into<PathBuf>) -> QueueResult<(Self, Vec<QueueRecord>, i64)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (pending, next_seq, acked_rows) = replay(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok((
            Self {
                path,
                file,
                acked_rows,
            },
            pending,
            next_seq,
        ))
    }

    /// Appends push records, durable before return.
    pub(crate) async fn append_pushes(&mut self, records: &[QueueRecord]) -> QueueResult<()> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, &LogEntry::Push(record.clone()))?;
            buffer.push(b'\n');
        }
        self.write_durable(&buffer).await
    }

    /// Appends an acknowledgement for the given sequence numbers.
    pub(crate) async fn append_ack(&mut self, seqs: Vec<i64>) -> QueueResult<()> {
        let mut buffer = serde_json::to_vec(&LogEntry::Ack { seqs })?;
        buffer.push(b'\n');
        self.write_durable(&buffer).await?;
        self.acked_rows += 1;
        Ok(())
    }

    /// Returns `true` once enough garbage accumulated to justify a rewrite.
    pub(crate) fn wants_compaction(&self, pending_len: usize) -> bool {
        self.acked_rows >= COMPACT_THRESHOLD && self.acked_rows > pending_len
    }

    /// Rewrites the log keeping only the supplied pending records.
    pub(crate) async fn compact(&mut self, pending: &[QueueRecord]) -> QueueResult<()> {
        let tmp_path = self.path.with_extension("log.tmp");

        let mut buffer = Vec::new();
        for record in pending {
            serde_json::to_writer(&mut buffer, &LogEntry::Push(record.clone()))?;
            buffer.push(b'\n');
        }

        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&buffer).await?;
        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).await?;

        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        self.acked_rows = 0;
        Ok(())
    }

    async fn write_durable(&mut self, bytes: &[u8]) -> QueueResult<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

async fn replay(path: &Path) -> QueueResult<(Vec<QueueRecord>, i64, usize)> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    let mut pending: BTreeMap<i64, QueueRecord> = BTreeMap::new();
    let mut next_seq: i64 = 1;
    let mut acked_rows = 0;

    for chunk in data.split(|byte| *byte == b'\n').filter(|c| !c.is_empty()) {
        let entry: LogEntry = match serde_json::from_slice(chunk) {
            Ok(entry) => entry,
            Err(err) => {
                // A torn trailing line from an interrupted write; everything
                // before it already reached disk.
                warn!(path = %path.display(), %err, "stopping queue log replay at undecodable entry");
                break;
            }
        };

        match entry {
            LogEntry::Push(record) => {
                next_seq = next_seq.max(record.seq + 1);
                pending.insert(record.seq, record);
            }
            LogEntry::Ack { seqs } => {
                for seq in seqs {
                    if pending.remove(&seq).is_some() {
                        acked_rows += 1;
                    }
                }
            }
        }
    }

    Ok((pending.into_values().collect(), next_seq, acked_rows))
}
