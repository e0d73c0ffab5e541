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

//! The disk driver: one [`TopicLog`](zqueue_common_storage_log::TopicLog)
//! per topic under `path`, a write buffer per topic and a persistent delay
//! scheduler.
//!
//! ```text
//! <path>/
//! ├── .delay/pending.{1,2,current}     delayed messages
//! └── <topic>/
//!     ├── 00000000000000000000.seg     segments, named by base offset
//!     └── consumers/<group>.offset.*   per-group checkpoints
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use snafu::{IntoError, ResultExt, ensure};
use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, error, info, warn};
use zqueue_common_storage_log::{LogConfig, SlotFile, Tailer, record_disk_size};
use zqueue_common_worker::{Manager, ManagerConfig};

use crate::{
    config::DiskConfig,
    delay::{DelayScheduler, DelayWorker},
    driver::{Driver, DriverKind, Subscription},
    error::{
        ClosedSnafu, NoRuntimeSnafu, Result, ShutdownTimeoutSnafu, StorageSnafu, ValidationSnafu,
    },
    message::{Message, RunType},
    metrics::{MESSAGES_DELAYED, MESSAGES_PRODUCED},
    topic::{Topic, TopicTable, validate_group_name, validate_topic_name},
};

/// Sub-directory of a topic holding consumer checkpoints.
const CONSUMER_DIR: &str = "consumers";
/// How long a stuck buffer lock is waited for when discarding.
const DISCARD_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct DiskDriver {
    config:     DiskConfig,
    log_config: LogConfig,
    topics:     Arc<TopicTable>,
    delay:      Arc<DelayScheduler>,
    workers:    Arc<Manager>,
    closed:     AtomicBool,
}

impl DiskDriver {
    pub(crate) fn open(config: DiskConfig, runtime: Handle) -> Result<Self> {
        let workers = Manager::start(
            ManagerConfig::builder()
                .runtime(runtime)
                .shutdown_timeout(config.shutdown_timeout)
                .build(),
        )
        .context(NoRuntimeSnafu)?;
        let workers = Arc::new(workers);

        let delay = Arc::new(DelayScheduler::open(&config.path)?);
        let topics = Arc::new(TopicTable::new(config.clone(), workers.clone()));
        workers
            .worker(DelayWorker::new(delay.clone(), topics.clone()))
            .name("delay-release")
            .with_notify(delay.wakeup())
            .on_notify()
            .spawn();

        info!(
            path = ?config.path,
            batch_size = config.batch_size,
            batch_time = ?config.batch_time,
            segment_size = config.segment_size,
            segment_limit = config.segment_limit,
            pending_delayed = delay.pending(),
            "Disk queue driver opened"
        );

        Ok(Self {
            log_config: config.log_config(),
            config,
            topics,
            delay,
            workers,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);
        Ok(())
    }

    /// A record that cannot fit in an empty segment can never be written.
    fn ensure_fits(&self, id: &str, body: &[u8]) -> Result<()> {
        let size = record_disk_size(id.len(), body.len()) as u64;
        let capacity = self.log_config.segment_capacity();
        ensure!(
            size <= capacity,
            ValidationSnafu {
                message: format!("message needs {size} bytes but a segment holds {capacity}"),
            }
        );
        Ok(())
    }

    fn new_message(topic: &str, id: String, body: Bytes) -> Message {
        Message {
            id,
            topic: topic.to_owned(),
            partition: 0,
            offset: Message::UNASSIGNED_OFFSET,
            timestamp: Utc::now(),
            run_type: RunType::Send,
            body,
        }
    }

    /// Flush every buffer. Returns the first failure after trying them all.
    /// Stops before the next topic once `abandon` is set.
    fn drain_all(topics: &[Arc<Topic>], abandon: &AtomicBool) -> Result<()> {
        let mut first_err = None;
        for topic in topics {
            if abandon.load(Ordering::Acquire) {
                warn!(topic = topic.name(), "Drain abandoned before this topic");
                break;
            }
            match topic.batcher().drain() {
                Ok(flushed) => debug!(topic = topic.name(), flushed, "Topic drained"),
                Err(err) => {
                    error!(topic = topic.name(), error = %err, "Failed to drain topic");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop whatever the drain did not reach. Returns the records dropped and
    /// the topics whose flush is still running.
    fn discard_all(topics: &[Arc<Topic>]) -> (usize, usize) {
        topics.iter().fold((0, 0), |(discarded, in_flight), topic| {
            match topic.batcher().discard(DISCARD_WAIT) {
                Some(dropped) => (discarded + dropped, in_flight),
                None => (discarded, in_flight + 1),
            }
        })
    }
}

#[async_trait]
impl Driver for DiskDriver {
    fn kind(&self) -> DriverKind { DriverKind::Disk }

    fn produce(&self, topic: &str, id: String, body: Bytes) -> Result<Message> {
        self.ensure_open()?;
        self.ensure_fits(&id, &body)?;
        let handle = self.topics.get_or_open(topic)?;
        let message = handle
            .batcher()
            .push(Self::new_message(topic, id, body))?;
        MESSAGES_PRODUCED.with_label_values(&[topic]).inc();
        Ok(message)
    }

    fn produce_delayed(&self, topic: &str, id: String, body: Bytes, delay: Duration) -> Result<Message> {
        self.ensure_open()?;
        validate_topic_name(topic)?;
        self.ensure_fits(&id, &body)?;

        let message = Self::new_message(topic, id, body);
        let delay = chrono::Duration::from_std(delay).map_err(|_| {
            ValidationSnafu {
                message: format!("delay of {delay:?} is out of range"),
            }
            .build()
        })?;
        let deliver_at = message.timestamp.checked_add_signed(delay).ok_or_else(|| {
            ValidationSnafu {
                message: "delivery time is out of range",
            }
            .build()
        })?;
        self.delay.schedule(&message, deliver_at)?;
        MESSAGES_DELAYED.with_label_values(&[topic]).inc();
        Ok(message)
    }

    fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        validate_group_name(group)?;
        let topic = self.topics.get_or_open(topic)?;
        Ok(Box::new(DiskSubscription::open(topic, group)?))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down disk queue driver");

        let delay_result = self.delay.close();
        if let Err(err) = &delay_result {
            error!(error = %err, "Failed to persist delayed messages on shutdown");
        }
        self.workers.shutdown().await;

        let topics = self.topics.all();
        let timeout = self.config.shutdown_timeout;
        let abandon = Arc::new(AtomicBool::new(false));
        let draining = {
            let topics = topics.clone();
            let abandon = abandon.clone();
            tokio::task::spawn_blocking(move || Self::drain_all(&topics, &abandon))
        };
        match tokio::time::timeout(timeout, draining).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                error!(error = %join_err, "Drain task panicked");
            }
            Err(_) => {
                abandon.store(true, Ordering::Release);
                let (discarded, in_flight) = Self::discard_all(&topics);
                warn!(?timeout, discarded, in_flight, "Shutdown timed out, buffered messages discarded");
                return ShutdownTimeoutSnafu {
                    timeout,
                    discarded,
                    in_flight,
                }
                .fail();
            }
        }

        delay_result?;
        info!(topics = topics.len(), "Disk queue driver stopped");
        Ok(())
    }
}

/// A group's cursor over one topic with a checkpoint file.
pub(crate) struct DiskSubscription {
    topic:      Arc<Topic>,
    group:      String,
    tailer:     Tailer,
    checkpoint: SlotFile,
    committed:  Option<u64>,
    notify:     Arc<Notify>,
}

impl DiskSubscription {
    fn open(topic: Arc<Topic>, group: &str) -> Result<Self> {
        let log = topic.log().clone();
        let checkpoint = SlotFile::open(log.dir().join(CONSUMER_DIR), format!("{group}.offset"))
            .context(StorageSnafu { topic: topic.name() })?;
        let raw = match checkpoint.read() {
            Ok(raw) => raw,
            Err(err) if err.is_corruption() => {
                warn!(topic = topic.name(), group, error = %err, "Damaged checkpoint ignored");
                None
            }
            Err(err) => return Err(StorageSnafu { topic: topic.name() }.into_error(err)),
        };
        let stored = raw.and_then(|bytes| match <[u8; 8]>::try_from(bytes.as_slice()) {
            Ok(raw) => Some(u64::from_le_bytes(raw)),
            Err(_) => {
                warn!(topic = topic.name(), group, len = bytes.len(), "Malformed checkpoint ignored");
                None
            }
        });

        let next_offset = log.next_offset();
        let start = match stored {
            Some(offset) if offset > next_offset => {
                warn!(
                    topic = topic.name(),
                    group,
                    checkpoint = offset,
                    next_offset,
                    "Checkpoint ahead of the log, resuming at its end"
                );
                next_offset
            }
            Some(offset) => offset,
            None => log.earliest_offset(),
        };
        info!(topic = topic.name(), group, start, "Subscription opened");

        Ok(Self {
            notify: topic.batcher().subscribe_commits(),
            tailer: Tailer::from_offset(log, start),
            group: group.to_owned(),
            checkpoint,
            committed: stored,
            topic,
        })
    }
}

impl Subscription for DiskSubscription {
    fn topic(&self) -> &str { self.topic.name() }

    fn group(&self) -> &str { &self.group }

    fn next_offset(&self) -> u64 { self.tailer.next_offset() }

    fn poll(&mut self) -> Result<Option<Message>> {
        match self.tailer.read_next() {
            Ok(record) => Ok(record.map(|record| Message::from_record(self.topic.name(), record).received())),
            Err(err) if err.is_corruption() => {
                self.tailer.skip_segment();
                Err(StorageSnafu { topic: self.topic.name() }.into_error(err))
            }
            Err(err) => Err(err).context(StorageSnafu { topic: self.topic.name() }),
        }
    }

    fn commit(&mut self) -> Result<()> {
        let offset = self.tailer.next_offset();
        if self.committed == Some(offset) {
            return Ok(());
        }
        self.checkpoint
            .write(&offset.to_le_bytes())
            .context(StorageSnafu { topic: self.topic.name() })?;
        self.committed = Some(offset);
        debug!(topic = self.topic.name(), group = %self.group, offset, "Checkpoint committed");
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> { self.notify.clone() }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::ErrorKind;

    fn config(dir: &TempDir) -> DiskConfig {
        DiskConfig {
            path: dir.path().to_path_buf(),
            batch_size: 2,
            batch_time: Duration::from_secs(60),
            segment_size: 4096,
            ..DiskConfig::default()
        }
    }

    #[tokio::test]
    async fn test_subscription_resumes_from_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        for body in ["a", "b", "c", "d"] {
            driver
                .produce("orders", format!("id-{body}"), Bytes::from(body))
                .unwrap();
        }

        let mut sub = driver.subscribe("orders", "billing").unwrap();
        assert_eq!(sub.poll().unwrap().unwrap().body, Bytes::from_static(b"a"));
        assert_eq!(sub.poll().unwrap().unwrap().body, Bytes::from_static(b"b"));
        sub.commit().unwrap();
        drop(sub);

        let mut again = driver.subscribe("orders", "billing").unwrap();
        assert_eq!(again.next_offset(), 2);
        let message = again.poll().unwrap().unwrap();
        assert_eq!(message.body, Bytes::from_static(b"c"));
        assert_eq!(message.run_type, RunType::Receive);

        // A different group starts from the beginning.
        let mut other = driver.subscribe("orders", "audit").unwrap();
        assert_eq!(other.poll().unwrap().unwrap().offset, 0);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();

        let err = driver
            .produce("orders", "big".to_owned(), Bytes::from(vec![0u8; 8192]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_driver_refuses_work() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        driver.produce("orders", "1".to_owned(), Bytes::from("x")).unwrap();
        driver.shutdown().await.unwrap();
        driver.shutdown().await.unwrap();

        for err in [
            driver.produce("orders", "2".to_owned(), Bytes::from("y")).unwrap_err(),
            driver
                .produce_delayed("orders", "3".to_owned(), Bytes::from("z"), Duration::from_secs(1))
                .unwrap_err(),
            driver.subscribe("orders", "g").err().unwrap(),
        ] {
            assert_eq!(err.kind(), ErrorKind::Closed);
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let temp_dir = TempDir::new().unwrap();
        {
            let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
            driver.produce("orders", "1".to_owned(), Bytes::from("only")).unwrap();
            driver.shutdown().await.unwrap();
        }

        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        let mut sub = driver.subscribe("orders", "g").unwrap();
        assert_eq!(sub.poll().unwrap().unwrap().body, Bytes::from_static(b"only"));
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_beyond_log_is_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        driver.produce("orders", "1".to_owned(), Bytes::from("a")).unwrap();
        driver.produce("orders", "2".to_owned(), Bytes::from("b")).unwrap();

        let dir = temp_dir.path().join("orders").join(CONSUMER_DIR);
        let mut checkpoint = SlotFile::open(&dir, "g.offset").unwrap();
        checkpoint.write(&99u64.to_le_bytes()).unwrap();

        let sub = driver.subscribe("orders", "g").unwrap();
        assert_eq!(sub.next_offset(), 2);
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_torn_checkpoint_pointer_keeps_position() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        for (id, body) in [("1", "a"), ("2", "b"), ("3", "c"), ("4", "d")] {
            driver.produce("orders", id.to_owned(), Bytes::from(body)).unwrap();
        }

        let mut sub = driver.subscribe("orders", "g").unwrap();
        sub.poll().unwrap().unwrap();
        sub.commit().unwrap();
        sub.poll().unwrap().unwrap();
        sub.commit().unwrap();
        drop(sub);

        let dir = temp_dir.path().join("orders").join(CONSUMER_DIR);
        std::fs::write(dir.join("g.offset.current"), b"").unwrap();

        let sub = driver.subscribe("orders", "g").unwrap();
        assert_eq!(sub.next_offset(), 2);
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_damaged_checkpoint_starts_from_earliest() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        driver.produce("orders", "1".to_owned(), Bytes::from("a")).unwrap();
        driver.produce("orders", "2".to_owned(), Bytes::from("b")).unwrap();

        let dir = temp_dir.path().join("orders").join(CONSUMER_DIR);
        let mut checkpoint = SlotFile::open(&dir, "g.offset").unwrap();
        checkpoint.write(&1u64.to_le_bytes()).unwrap();
        std::fs::write(dir.join("g.offset.1"), b"ZQST torn").unwrap();

        let mut sub = driver.subscribe("orders", "g").unwrap();
        assert_eq!(sub.next_offset(), 0);
        assert_eq!(sub.poll().unwrap().unwrap().body, Bytes::from_static(b"a"));
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_drain_leaves_the_rest_to_discard() {
        let temp_dir = TempDir::new().unwrap();
        let driver = DiskDriver::open(config(&temp_dir), Handle::current()).unwrap();
        driver.produce("orders", "1".to_owned(), Bytes::from("a")).unwrap();
        driver.produce("audit", "2".to_owned(), Bytes::from("b")).unwrap();

        let topics = driver.topics.all();
        let abandon = AtomicBool::new(true);
        DiskDriver::drain_all(&topics, &abandon).unwrap();
        assert!(topics.iter().all(|topic| topic.batcher().pending() == 1));

        assert_eq!(DiskDriver::discard_all(&topics), (2, 0));
        assert!(topics.iter().all(|topic| topic.log().next_offset() == 0));
    }
}
