//! The multi-type queue facade.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use warden_primitives::{Message, MessageType};

use crate::store::{QueueRecord, TypeLog};
use crate::QueueResult;

/// Attempts made against the backing store before giving up on an append.
const STORAGE_RETRIES: u32 = 3;
/// Initial backoff between storage retries; doubles per attempt.
const STORAGE_BACKOFF: Duration = Duration::from_millis(50);

struct LaneState {
    log: TypeLog,
    pending: VecDeque<QueueRecord>,
    next_seq: i64,
}

struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

const fn lane_index(message_type: MessageType) -> usize {
    match message_type {
        MessageType::Stateful => 0,
        MessageType::Stateless => 1,
        MessageType::Command => 2,
        MessageType::CommandResult => 3,
    }
}

/// Durable FIFO queue with one independent lane per [`MessageType`].
///
/// Ordering is strict FIFO within a (type, module) pair; across types there
/// is no ordering relationship. All operations serialize on the owning
/// lane's mutex.
pub struct MultiTypeQueue {
    lanes: [Lane; 4],
}

impl MultiTypeQueue {
    /// Opens the queue in `dir`, replaying any logs left by a previous run.
    ///
    /// Records that were fetched but never popped before a crash are
    /// pending again: delivery is at least once.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`](crate::QueueError) when a log cannot be
    /// opened or replayed.
    pub async fn open(dir: impl Into<PathBuf>) -> QueueResult<Self> {
        let dir = dir.into();

        let mut lanes = Vec::with_capacity(MessageType::ALL.len());
        for message_type in MessageType::ALL {
            lanes.push(Self::open_lane(&dir, message_type).await?);
        }

        let Ok(lanes) = <[Lane; 4]>::try_from(lanes) else {
            unreachable!("one lane per message type");
        };

        Ok(Self { lanes })
    }

    async fn open_lane(dir: &Path, message_type: MessageType) -> QueueResult<Lane> {
        let path = dir.join(format!("{message_type}.log"));
        let (log, pending, next_seq) = TypeLog::open(path).await?;
        debug!(%message_type, pending = pending.len(), "queue lane opened");
        Ok(Lane {
            state: Mutex::new(LaneState {
                log,
                pending: pending.into(),
                next_seq,
            }),
            notify: Notify::new(),
        })
    }

    fn lane(&self, message_type: MessageType) -> &Lane {
        &self.lanes[lane_index(message_type)]
    }

    /// Appends a message, durable before return.
    ///
    /// # Errors
    ///
    /// Returns the final storage error once the bounded retries are
    /// exhausted; the message is not enqueued in that case.
    pub async fn push(&self, message: Message) -> QueueResult<i64> {
        let lane = self.lane(message.message_type());
        let mut state = lane.state.lock().await;

        let record = QueueRecord {
            seq: state.next_seq,
            message,
        };

        append_with_retries(&mut state.log, std::slice::from_ref(&record)).await?;

        let seq = record.seq;
        state.next_seq = seq + 1;
        state.pending.push_back(record);
        drop(state);

        lane.notify.notify_waiters();
        Ok(seq)
    }

    /// Appends a batch of messages.
    ///
    /// Messages of one type are committed with a single durable write, so
    /// a batch is all-or-nothing within each type; a batch spanning several
    /// types commits type by type.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; lanes committed before it keep
    /// their records.
    pub async fn push_batch(&self, messages: Vec<Message>) -> QueueResult<()> {
        for message_type in MessageType::ALL {
            let batch: Vec<Message> = messages
                .iter()
                .filter(|m| m.message_type() == message_type)
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }

            let lane = self.lane(message_type);
            let mut state = lane.state.lock().await;

            let mut records = Vec::with_capacity(batch.len());
            for message in batch {
                records.push(QueueRecord {
                    seq: state.next_seq + records.len() as i64,
                    message,
                });
            }

            append_with_retries(&mut state.log, &records).await?;

            state.next_seq += records.len() as i64;
            state.pending.extend(records);
            drop(state);

            lane.notify.notify_waiters();
        }

        Ok(())
    }

    /// Returns the oldest pending message matching the module filter,
    /// suspending until one exists. The record stays pending.
    pub async fn get_next(&self, message_type: MessageType, module: &str) -> Message {
        let mut messages = self.get_next_n(message_type, 1, module, "").await;
        // get_next_n returns at least one message by contract.
        messages.swap_remove(0)
    }

    /// Returns up to `n` of the oldest pending messages matching the
    /// filters, suspending until at least one exists.
    ///
    /// Returned records are not marked in flight; only [`pop_n`] changes
    /// their state.
    ///
    /// [`pop_n`]: MultiTypeQueue::pop_n
    pub async fn get_next_n(
        &self,
        message_type: MessageType,
        n: usize,
        module: &str,
        module_type: &str,
    ) -> Vec<Message> {
        let n = n.max(1);
        let lane = self.lane(message_type);

        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = lane.state.lock().await;
                let matches: Vec<Message> = state
                    .pending
                    .iter()
                    .filter(|record| matches_filters(record, module, module_type))
                    .take(n)
                    .map(|record| record.message.clone())
                    .collect();
                if !matches.is_empty() {
                    return matches;
                }
            }

            notified.as_mut().await;
        }
    }

    /// Removes the oldest `n` pending records matching the module filter,
    /// returning how many were actually removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the acknowledgement cannot be made
    /// durable; no records are removed in that case.
    pub async fn pop_n(
        &self,
        message_type: MessageType,
        n: usize,
        module: &str,
    ) -> QueueResult<usize> {
        let lane = self.lane(message_type);
        let mut state = lane.state.lock().await;

        let seqs: Vec<i64> = state
            .pending
            .iter()
            .filter(|record| matches_filters(record, module, ""))
            .take(n)
            .map(|record| record.seq)
            .collect();

        if seqs.is_empty() {
            return Ok(0);
        }

        ack_with_retries(&mut state.log, seqs.clone()).await?;
        state.pending.retain(|record| !seqs.contains(&record.seq));

        if state.log.wants_compaction(state.pending.len()) {
            let pending: Vec<QueueRecord> = state.pending.iter().cloned().collect();
            if let Err(err) = state.log.compact(&pending).await {
                error!(%message_type, %err, "queue log compaction failed");
            }
        }

        Ok(seqs.len())
    }

    /// Returns `true` when no pending record matches the module filter.
    pub async fn is_empty(&self, message_type: MessageType, module: &str) -> bool {
        let state = self.lane(message_type).state.lock().await;
        !state
            .pending
            .iter()
            .any(|record| matches_filters(record, module, ""))
    }
}

fn matches_filters(record: &QueueRecord, module: &str, module_type: &str) -> bool {
    (module.is_empty() || record.message.module() == module)
        && (module_type.is_empty() || record.message.module_type() == module_type)
}

// Appends are idempotent under replay (duplicate seqs collapse), so a retry
// after a partial write cannot duplicate deliveries.
async fn append_with_retries(log: &mut TypeLog, records: &[QueueRecord]) -> QueueResult<()> {
    let mut backoff = STORAGE_BACKOFF;
    let mut attempt = 1;
    loop {
        match log.append_pushes(records).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < STORAGE_RETRIES => {
                debug!(%err, attempt, "queue storage write failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => {
                error!(%err, "queue storage write failed after retries");
                return Err(err);
            }
        }
    }
}

async fn ack_with_retries(log: &mut TypeLog, seqs: Vec<i64>) -> QueueResult<()> {
    let mut backoff = STORAGE_BACKOFF;
    let mut attempt = 1;
    loop {
        match log.append_ack(seqs.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < STORAGE_RETRIES => {
                debug!(%err, attempt, "queue acknowledgement failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => {
                error!(%err, "queue acknowledgement failed after retries");
                return Err(err);
            }
        }
    }
}
