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

//! Delayed delivery.
//!
//! Pending delayed messages sit in a min-heap keyed by delivery time and are
//! persisted as a full snapshot in a [`SlotFile`] under `<path>/.delay` after
//! every change. A restart reloads the snapshot, so a delayed message is
//! released exactly as if the process had kept running, or right away when
//! its time already passed. Entries taken for release stay in every
//! snapshot until their topic has been flushed; a crash in between delivers
//! them twice rather than never.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use zqueue_common_storage_log::SlotFile;
use zqueue_common_worker::{WorkError, WorkResult, Worker, WorkerContext};

use crate::{
    error::{ClosedSnafu, DelayDecodeSnafu, DelayEncodeSnafu, DelayPersistSnafu, Result},
    message::{Message, RunType},
    metrics::{DELAY_PENDING, MESSAGES_RELEASED},
    topic::{Topic, TopicTable},
};

/// Directory under the queue root holding scheduler state.
pub(crate) const DELAY_DIR: &str = ".delay";
const SNAPSHOT_NAME: &str = "pending";
/// Pause before retrying after a release failed.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DelayedEntry {
    pub deliver_at_ms: i64,
    /// Breaks ties between entries due at the same millisecond.
    pub seq:           u64,
    pub topic:         String,
    pub id:            String,
    pub created_ms:    i64,
    pub body:          Vec<u8>,
}

impl DelayedEntry {
    fn to_message(&self) -> Message {
        Message {
            id:        self.id.clone(),
            topic:     self.topic.clone(),
            partition: 0,
            offset:    Message::UNASSIGNED_OFFSET,
            timestamp: DateTime::from_timestamp_millis(self.created_ms).unwrap_or_default(),
            run_type:  RunType::Send,
            body:      Bytes::copy_from_slice(&self.body),
        }
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at_ms, self.seq).cmp(&(other.deliver_at_ms, other.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    entries:  Vec<DelayedEntry>,
}

struct DelayState {
    heap:      BinaryHeap<Reverse<DelayedEntry>>,
    /// Taken for release, not yet flushed to their topic.
    in_flight: Vec<DelayedEntry>,
    next_seq:  u64,
    store:     SlotFile,
    closed:    bool,
}

impl DelayState {
    fn persist(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            next_seq: self.next_seq,
            entries:  self
                .heap
                .iter()
                .map(|Reverse(entry)| entry)
                .chain(&self.in_flight)
                .cloned()
                .collect(),
        };
        let payload =
            bincode::serde::encode_to_vec(&snapshot, bincode::config::standard()).context(DelayEncodeSnafu)?;
        self.store.write(&payload).context(DelayPersistSnafu)?;
        set_pending_gauge(self.heap.len());
        Ok(())
    }
}

fn set_pending_gauge(pending: usize) { DELAY_PENDING.set(i64::try_from(pending).unwrap_or(i64::MAX)); }

/// Holds delayed messages until they are due.
pub(crate) struct DelayScheduler {
    state:  Mutex<DelayState>,
    wakeup: Arc<Notify>,
}

impl DelayScheduler {
    /// Open the scheduler under `root`, reloading pending entries.
    pub(crate) fn open(root: &Path) -> Result<Self> {
        let store = SlotFile::open(root.join(DELAY_DIR), SNAPSHOT_NAME).context(DelayPersistSnafu)?;
        let snapshot = match store.read().context(DelayPersistSnafu)? {
            Some(bytes) => {
                let (snapshot, _): (Snapshot, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .context(DelayDecodeSnafu)?;
                snapshot
            }
            None => Snapshot::default(),
        };

        let pending = snapshot.entries.len();
        let next_seq = snapshot
            .entries
            .iter()
            .map(|entry| entry.seq + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.next_seq);
        let wakeup = Arc::new(Notify::new());
        if pending > 0 {
            info!(pending, "Reloaded pending delayed messages");
            wakeup.notify_one();
        }
        set_pending_gauge(pending);

        Ok(Self {
            state: Mutex::new(DelayState {
                heap: snapshot.entries.into_iter().map(Reverse).collect(),
                in_flight: Vec::new(),
                next_seq,
                store,
                closed: false,
            }),
            wakeup,
        })
    }

    /// Notifier the release worker waits on.
    pub(crate) fn wakeup(&self) -> Arc<Notify> { self.wakeup.clone() }

    /// Record a message for delivery at `deliver_at`. The entry is on disk
    /// when this returns.
    pub(crate) fn schedule(&self, message: &Message, deliver_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(!state.closed, ClosedSnafu);

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = DelayedEntry {
            deliver_at_ms: deliver_at.timestamp_millis(),
            seq,
            topic: message.topic.clone(),
            id: message.id.clone(),
            created_ms: message.timestamp.timestamp_millis(),
            body: message.body.to_vec(),
        };
        state.heap.push(Reverse(entry));

        if let Err(err) = state.persist() {
            state.heap.retain(|Reverse(entry)| entry.seq != seq);
            return Err(err);
        }
        drop(state);

        debug!(topic = %message.topic, id = %message.id, %deliver_at, "Delayed message scheduled");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Take every entry due at or before `now_ms`, oldest first. The entries
    /// stay persisted until [`DelayScheduler::settle`] reports them flushed.
    pub(crate) fn take_due(&self, now_ms: i64) -> Vec<DelayedEntry> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while state
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.deliver_at_ms <= now_ms)
        {
            if let Some(Reverse(entry)) = state.heap.pop() {
                due.push(entry);
            }
        }
        state.in_flight.extend(due.iter().cloned());
        due
    }

    /// Finish a release pass: entries in `flushed` are forgotten, every other
    /// taken entry goes back to the heap.
    pub(crate) fn settle(&self, flushed: &HashSet<u64>) -> Result<()> {
        let mut state = self.state.lock();
        let taken = std::mem::take(&mut state.in_flight);
        let before = taken.len();
        let retry: Vec<_> = taken
            .into_iter()
            .filter(|entry| !flushed.contains(&entry.seq))
            .collect();
        let forgotten = before - retry.len();
        state.heap.extend(retry.into_iter().map(Reverse));
        if forgotten == 0 {
            return Ok(());
        }
        state.persist()
    }

    /// Delivery time of the earliest pending entry.
    pub(crate) fn next_deadline_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .heap
            .peek()
            .map(|Reverse(entry)| entry.deliver_at_ms)
    }

    /// Entries waiting for their delivery time.
    pub(crate) fn pending(&self) -> usize { self.state.lock().heap.len() }

    /// Persist the pending set, in-flight entries included, one last time and
    /// refuse new entries.
    pub(crate) fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let pending = state.heap.len();
        state.persist()?;
        info!(pending, "Delay scheduler closed");
        Ok(())
    }
}

/// Moves due entries into their topic buffers.
pub(crate) struct DelayWorker {
    scheduler: Arc<DelayScheduler>,
    topics:    Arc<TopicTable>,
}

impl DelayWorker {
    pub(crate) const fn new(scheduler: Arc<DelayScheduler>, topics: Arc<TopicTable>) -> Self {
        Self { scheduler, topics }
    }
}

#[async_trait]
impl Worker for DelayWorker {
    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult {
        loop {
            let scheduler = self.scheduler.clone();
            let topics = self.topics.clone();
            let released = tokio::task::spawn_blocking(move || release_due(&scheduler, &topics))
                .await
                .map_err(|e| WorkError::fatal_with_source("delay release task panicked", e))?;

            let mut wait = match self.scheduler.next_deadline_ms() {
                Some(at) => {
                    let millis = at.saturating_sub(Utc::now().timestamp_millis()).max(0);
                    Duration::from_millis(u64::try_from(millis).unwrap_or_default())
                }
                None if released.is_ok() => return Ok(()),
                None => RETRY_BACKOFF,
            };
            if let Err(err) = released {
                warn!(error = %err, "Releasing delayed messages failed, will retry");
                wait = wait.max(RETRY_BACKOFF);
            }

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = ctx.notified() => {}
                () = ctx.cancelled() => return Ok(()),
            }
        }
    }
}

/// Release due entries, flush the touched topics and persist what is left.
fn release_due(scheduler: &DelayScheduler, topics: &TopicTable) -> Result<usize> {
    let due = scheduler.take_due(Utc::now().timestamp_millis());
    if due.is_empty() {
        return Ok(0);
    }

    let mut first_err = None;
    let mut pushed: HashMap<String, (Arc<Topic>, Vec<u64>)> = HashMap::new();

    for entry in due {
        let result = topics.get_or_open(&entry.topic).and_then(|topic| {
            topic.batcher().push(entry.to_message())?;
            Ok(topic)
        });
        match result {
            Ok(topic) => pushed
                .entry(entry.topic)
                .or_insert_with(|| (topic, Vec::new()))
                .1
                .push(entry.seq),
            Err(err) => {
                warn!(topic = %entry.topic, id = %entry.id, error = %err, "Delayed message not released");
                first_err.get_or_insert(err);
            }
        }
    }

    let mut flushed = HashSet::new();
    for (name, (topic, seqs)) in pushed {
        match topic.batcher().flush_now() {
            Ok(_) => {
                MESSAGES_RELEASED
                    .with_label_values(&[&name])
                    .inc_by(seqs.len() as u64);
                flushed.extend(seqs);
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    let released = flushed.len();
    scheduler.settle(&flushed)?;
    debug!(released, "Delayed messages released");

    first_err.map_or(Ok(released), Err)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::ErrorKind;

    fn message(topic: &str, body: &str) -> Message {
        Message {
            id:        format!("id-{body}"),
            topic:     topic.to_owned(),
            partition: 0,
            offset:    Message::UNASSIGNED_OFFSET,
            timestamp: Utc::now(),
            run_type:  RunType::Send,
            body:      Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    fn at(ms: i64) -> DateTime<Utc> { DateTime::from_timestamp_millis(ms).unwrap() }

    #[test]
    fn test_due_entries_come_out_in_delivery_order() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();

        scheduler.schedule(&message("t", "late"), at(3_000)).unwrap();
        scheduler.schedule(&message("t", "early"), at(1_000)).unwrap();
        scheduler.schedule(&message("t", "tie"), at(1_000)).unwrap();

        assert!(scheduler.take_due(999).is_empty());
        let due: Vec<Vec<u8>> = scheduler
            .take_due(2_000)
            .into_iter()
            .map(|entry| entry.body)
            .collect();
        assert_eq!(due, vec![b"early".to_vec(), b"tie".to_vec()]);
        assert_eq!(scheduler.next_deadline_ms(), Some(3_000));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_pending_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
            scheduler.schedule(&message("audit", "a"), at(5_000)).unwrap();
            scheduler.schedule(&message("audit", "b"), at(6_000)).unwrap();
            scheduler.close().unwrap();
        }

        let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.next_deadline_ms(), Some(5_000));

        // Sequence numbers continue after a reload.
        scheduler.schedule(&message("audit", "c"), at(5_000)).unwrap();
        let due = scheduler.take_due(5_000);
        assert_eq!(due[0].body, b"a".to_vec());
        assert_eq!(due[1].body, b"c".to_vec());
        assert!(due[1].seq > due[0].seq);
    }

    #[test]
    fn test_unflushed_entries_return_to_the_heap() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
        scheduler.schedule(&message("t", "x"), at(10)).unwrap();
        scheduler.schedule(&message("t", "y"), at(20)).unwrap();

        let due = scheduler.take_due(20);
        assert_eq!(scheduler.pending(), 0);

        scheduler.settle(&HashSet::from([due[0].seq])).unwrap();
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.next_deadline_ms(), Some(20));
        drop(scheduler);

        let reopened = DelayScheduler::open(temp_dir.path()).unwrap();
        let left: Vec<Vec<u8>> = reopened
            .take_due(i64::MAX)
            .into_iter()
            .map(|entry| entry.body)
            .collect();
        assert_eq!(left, vec![b"y".to_vec()]);
    }

    #[test]
    fn test_taken_entries_survive_concurrent_schedule() {
        let temp_dir = TempDir::new().unwrap();
        {
            let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
            scheduler.schedule(&message("t", "due"), at(10)).unwrap();
            assert_eq!(scheduler.take_due(100).len(), 1);

            // Rewrites the snapshot while "due" is being released.
            let later = Utc::now() + chrono::Duration::hours(1);
            scheduler.schedule(&message("t", "later"), later).unwrap();
        }

        let reopened = DelayScheduler::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.pending(), 2);
        assert_eq!(reopened.next_deadline_ms(), Some(10));
    }

    #[test]
    fn test_close_keeps_taken_entries() {
        let temp_dir = TempDir::new().unwrap();
        {
            let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
            scheduler.schedule(&message("t", "due"), at(10)).unwrap();
            scheduler.take_due(100);
            scheduler.close().unwrap();
        }

        let reopened = DelayScheduler::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.pending(), 1);
    }

    #[test]
    fn test_closed_scheduler_refuses_entries() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = DelayScheduler::open(temp_dir.path()).unwrap();
        scheduler.close().unwrap();

        let err = scheduler.schedule(&message("t", "x"), at(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_garbage_snapshot_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SlotFile::open(temp_dir.path().join(DELAY_DIR), SNAPSHOT_NAME).unwrap();
        store.write(&[0xFF; 7]).unwrap();

        let err = DelayScheduler::open(temp_dir.path()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CorruptionError);
    }
}
