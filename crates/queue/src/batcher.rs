// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-topic write buffer.
//!
//! Offsets are handed out when a message enters the buffer, so the order of
//! accepted sends is the order on disk. The buffer is appended to the log as
//! one batch when it reaches `batchSize` records, or when its oldest record
//! has waited `batchTime`; the [`BatchFlusher`] worker handles the second
//! case.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::{ResultExt, ensure};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, error, info, warn};
use zqueue_common_storage_log::{AppendStats, Record, TopicLog};
use zqueue_common_worker::{WorkError, WorkResult, Worker, WorkerContext};

use crate::{
    config::DiskConfig,
    error::{ClosedSnafu, Result, StorageSnafu},
    message::Message,
    metrics::{FLUSH_BATCH_SIZE, FLUSH_FAILURES, FLUSHES, SEGMENTS_EVICTED, SEGMENTS_ROLLED},
};

struct PendingBatch {
    records:     Vec<Record>,
    /// Offset the next accepted message receives.
    next_offset: u64,
    /// Set while the buffer is non-empty.
    deadline:    Option<Instant>,
    closed:      bool,
}

pub(crate) struct Batcher {
    topic:       String,
    log:         Arc<TopicLog>,
    batch_size:  usize,
    batch_time:  Duration,
    max_pending: usize,
    state:       Mutex<PendingBatch>,
    /// Wakes the flusher when a deadline is armed.
    flusher:     Arc<Notify>,
    /// Woken after every successful flush.
    watchers:    Mutex<Vec<Arc<Notify>>>,
}

impl Batcher {
    pub(crate) fn new(log: Arc<TopicLog>, disk: &DiskConfig) -> Self {
        Self {
            topic: log.name().to_owned(),
            batch_size: disk.batch_size,
            batch_time: disk.batch_time,
            max_pending: disk.max_pending().max(disk.batch_size),
            state: Mutex::new(PendingBatch {
                records:     Vec::with_capacity(disk.batch_size),
                next_offset: log.next_offset(),
                deadline:    None,
                closed:      false,
            }),
            flusher: Arc::new(Notify::new()),
            watchers: Mutex::new(Vec::new()),
            log,
        }
    }

    pub(crate) fn topic(&self) -> &str { &self.topic }

    pub(crate) fn flusher_notify(&self) -> Arc<Notify> { self.flusher.clone() }

    /// Register for a wake-up after each flush.
    pub(crate) fn subscribe_commits(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.watchers.lock().push(notify.clone());
        notify
    }

    /// Accept a message, assign its offset and flush if the batch is full.
    ///
    /// A failed size-triggered flush is retried once. When the retry fails
    /// too, the message is taken back out of the buffer and the storage error
    /// is returned; earlier messages stay buffered for the next flush.
    pub(crate) fn push(&self, mut message: Message) -> Result<Message> {
        let mut state = self.state.lock();
        ensure!(!state.closed, ClosedSnafu);

        if state.records.len() >= self.max_pending {
            warn!(
                topic = %self.topic,
                pending = state.records.len(),
                "Write buffer full, flushing before accepting more"
            );
            self.flush_locked(&mut state)?;
        }

        message.offset = state.next_offset;
        state.next_offset += 1;
        state.records.push(message.to_record());

        if state.deadline.is_none() {
            state.deadline = Some(Instant::now() + self.batch_time);
            self.flusher.notify_one();
        }

        if state.records.len() >= self.batch_size
            && let Err(err) = self.flush_locked(&mut state)
        {
            warn!(topic = %self.topic, error = %err, "Batch flush failed, retrying once");
            if let Err(err) = self.flush_locked(&mut state) {
                if state
                    .records
                    .last()
                    .is_some_and(|record| record.offset == message.offset)
                {
                    state.records.pop();
                    state.next_offset -= 1;
                }
                if state.records.is_empty() {
                    state.deadline = None;
                }
                return Err(err);
            }
        }
        Ok(message)
    }

    /// Flush whatever is buffered right away.
    pub(crate) fn flush_now(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let result = self.flush_locked(&mut state);
        if result.is_err() && !state.records.is_empty() {
            state.deadline = Some(Instant::now() + self.batch_time);
        }
        result
    }

    /// Flush when the oldest buffered record has waited long enough.
    pub(crate) fn flush_if_due(&self) -> Result<usize> {
        let mut state = self.state.lock();
        match state.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                let result = self.flush_locked(&mut state);
                if result.is_err() && !state.records.is_empty() {
                    state.deadline = Some(Instant::now() + self.batch_time);
                }
                result
            }
            _ => Ok(0),
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> { self.state.lock().deadline }

    pub(crate) fn pending(&self) -> usize { self.state.lock().records.len() }

    /// Flush what is buffered and refuse further messages.
    pub(crate) fn drain(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.closed = true;
        let flushed = match self.flush_locked(&mut state) {
            Ok(flushed) => flushed,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "Final flush failed, retrying once");
                self.flush_locked(&mut state)?
            }
        };
        self.log.sync().context(StorageSnafu { topic: &self.topic })?;
        Ok(flushed)
    }

    /// Drop buffered records without writing them. Returns how many were
    /// dropped, or `None` if the buffer stayed locked for `wait` because a
    /// flush is still running.
    pub(crate) fn discard(&self, wait: Duration) -> Option<usize> {
        let mut state = self.state.try_lock_for(wait)?;
        state.closed = true;
        state.deadline = None;
        let dropped = state.records.len();
        state.records.clear();
        Some(dropped)
    }

    fn flush_locked(&self, state: &mut PendingBatch) -> Result<usize> {
        if state.records.is_empty() {
            state.deadline = None;
            return Ok(0);
        }

        match self.log.append_batch(&state.records) {
            Ok(stats) => {
                let flushed = state.records.len();
                state.records.clear();
                state.deadline = None;
                self.record_flush(flushed, &stats);
                self.notify_watchers();
                Ok(flushed)
            }
            Err(err) => {
                FLUSH_FAILURES.with_label_values(&[&self.topic]).inc();
                // Part of the batch may be durable if a roll happened first.
                let committed = self.log.next_offset();
                let before = state.records.len();
                state.records.retain(|record| record.offset >= committed);
                if state.records.len() < before {
                    self.notify_watchers();
                }
                error!(
                    topic = %self.topic,
                    error = %err,
                    committed,
                    still_buffered = state.records.len(),
                    "Batch append failed"
                );
                Err(err).context(StorageSnafu { topic: &self.topic })
            }
        }
    }

    fn record_flush(&self, flushed: usize, stats: &AppendStats) {
        FLUSHES.with_label_values(&[&self.topic]).inc();
        FLUSH_BATCH_SIZE
            .with_label_values(&[&self.topic])
            .observe(f64::from(u32::try_from(flushed).unwrap_or(u32::MAX)));
        if !stats.sealed.is_empty() {
            SEGMENTS_ROLLED
                .with_label_values(&[&self.topic])
                .inc_by(stats.sealed.len() as u64);
            info!(topic = %self.topic, sealed = ?stats.sealed, "Segment rolled");
        }
        if !stats.evicted.is_empty() {
            SEGMENTS_EVICTED
                .with_label_values(&[&self.topic])
                .inc_by(stats.evicted.len() as u64);
            info!(topic = %self.topic, evicted = ?stats.evicted, "Retention removed segments");
        }
        debug!(topic = %self.topic, records = flushed, bytes = stats.bytes, "Batch flushed");
    }

    fn notify_watchers(&self) {
        for watcher in self.watchers.lock().iter() {
            watcher.notify_one();
        }
    }
}

/// Flushes a topic's buffer once its deadline passes.
pub(crate) struct BatchFlusher {
    batcher: Arc<Batcher>,
}

impl BatchFlusher {
    pub(crate) const fn new(batcher: Arc<Batcher>) -> Self { Self { batcher } }
}

#[async_trait]
impl Worker for BatchFlusher {
    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult {
        while let Some(deadline) = self.batcher.deadline() {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = ctx.cancelled() => return Ok(()),
            }

            let batcher = self.batcher.clone();
            match tokio::task::spawn_blocking(move || batcher.flush_if_due()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(topic = self.batcher.topic(), error = %err, "Timed flush failed"),
                Err(join_err) => return Err(WorkError::fatal_with_source("flush task panicked", join_err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;
    use tempfile::TempDir;
    use zqueue_common_storage_log::Tailer;

    use super::*;
    use crate::{ErrorKind, message::RunType};

    fn batcher(dir: &TempDir, batch_size: usize, batch_time: Duration) -> Batcher {
        let disk = DiskConfig {
            path: dir.path().to_path_buf(),
            batch_size,
            batch_time,
            segment_size: 4096,
            ..DiskConfig::default()
        };
        let log = TopicLog::open(dir.path().join("orders"), "orders", disk.log_config()).unwrap();
        Batcher::new(Arc::new(log), &disk)
    }

    fn message(body: &str) -> Message {
        Message {
            id:        format!("id-{body}"),
            topic:     "orders".to_owned(),
            partition: 0,
            offset:    Message::UNASSIGNED_OFFSET,
            timestamp: Utc::now(),
            run_type:  RunType::Send,
            body:      Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn test_offsets_assigned_in_push_order() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 10, Duration::from_secs(60));

        let offsets: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|body| batcher.push(message(body)).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(batcher.pending(), 3);
        assert!(batcher.deadline().is_some());
        assert_eq!(batcher.log.next_offset(), 0);
    }

    #[test]
    fn test_full_batch_is_flushed_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 3, Duration::from_secs(60));

        for body in ["a", "b", "c"] {
            batcher.push(message(body)).unwrap();
        }
        assert_eq!(batcher.pending(), 0);
        assert!(batcher.deadline().is_none());
        assert_eq!(batcher.log.next_offset(), 3);

        let bodies: Vec<Bytes> = Tailer::from_offset(batcher.log.clone(), 0)
            .map(|record| record.unwrap().body)
            .collect();
        assert_eq!(bodies, vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c")
        ]);
    }

    #[test]
    fn test_flush_waits_for_deadline() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 10, Duration::from_millis(50));

        batcher.push(message("late")).unwrap();
        assert_eq!(batcher.flush_if_due().unwrap(), 0);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(batcher.flush_if_due().unwrap(), 1);
        assert_eq!(batcher.log.next_offset(), 1);
    }

    #[test]
    fn test_drain_flushes_and_closes() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 10, Duration::from_secs(60));

        batcher.push(message("x")).unwrap();
        assert_eq!(batcher.drain().unwrap(), 1);
        assert_eq!(batcher.log.next_offset(), 1);

        let err = batcher.push(message("y")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_discard_drops_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 10, Duration::from_secs(60));

        batcher.push(message("x")).unwrap();
        batcher.push(message("y")).unwrap();
        assert_eq!(batcher.discard(Duration::from_millis(10)), Some(2));
        assert_eq!(batcher.log.next_offset(), 0);
    }

    #[test]
    fn test_discard_gives_up_on_a_running_flush() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 10, Duration::from_secs(60));
        batcher.push(message("x")).unwrap();

        let flushing = batcher.state.lock();
        assert_eq!(batcher.discard(Duration::from_millis(10)), None);
        drop(flushing);

        assert_eq!(batcher.pending(), 1);
    }

    #[tokio::test]
    async fn test_watchers_woken_after_flush() {
        let temp_dir = TempDir::new().unwrap();
        let batcher = batcher(&temp_dir, 1, Duration::from_secs(60));
        let watcher = batcher.subscribe_commits();

        batcher.push(message("x")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), watcher.notified())
            .await
            .unwrap();
    }
}
