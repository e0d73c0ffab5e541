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

#![allow(dead_code)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;
use zqueue::{BoxError, ConsumerHandler, DiskConfig, HandlerContext, Message, QueueConfig};

pub fn config(dir: &TempDir) -> QueueConfig {
    zqueue_common_telemetry::init_default_ut_logging();
    QueueConfig {
        group_name: "tests".to_owned(),
        disk: DiskConfig {
            path: dir.path().to_path_buf(),
            batch_size: 1,
            batch_time: Duration::from_millis(200),
            segment_size: 64 * 1024,
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..DiskConfig::default()
        },
        ..QueueConfig::default()
    }
}

/// Records every message it sees; optionally rejects them all.
pub struct Collector {
    topic:    String,
    seen:     Arc<Mutex<Vec<Message>>>,
    arrivals: Mutex<Vec<DateTime<Utc>>>,
    reject:   bool,
}

impl Collector {
    pub fn new(topic: &str) -> (Arc<Self>, Arc<Mutex<Vec<Message>>>) { Self::build(topic, false) }

    pub fn rejecting(topic: &str) -> (Arc<Self>, Arc<Mutex<Vec<Message>>>) { Self::build(topic, true) }

    fn build(topic: &str, reject: bool) -> (Arc<Self>, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::new(Self {
            topic: topic.to_owned(),
            seen: seen.clone(),
            arrivals: Mutex::new(Vec::new()),
            reject,
        });
        (collector, seen)
    }

    /// Wall-clock time each message reached the handler.
    pub fn arrivals(&self) -> Vec<DateTime<Utc>> { self.arrivals.lock().clone() }
}

#[async_trait]
impl ConsumerHandler for Collector {
    fn topic(&self) -> &str { &self.topic }

    async fn handle(&self, _ctx: &HandlerContext, message: Message) -> Result<(), BoxError> {
        self.arrivals.lock().push(Utc::now());
        self.seen.lock().push(message);
        if self.reject {
            return Err("rejected by test handler".into());
        }
        Ok(())
    }
}

/// Wait until at least `count` messages arrived.
pub async fn wait_for(seen: &Mutex<Vec<Message>>, count: usize, within: Duration) -> Vec<Message> {
    let deadline = Instant::now() + within;
    loop {
        {
            let seen = seen.lock();
            if seen.len() >= count {
                return seen.clone();
            }
            assert!(
                Instant::now() < deadline,
                "expected {count} messages within {within:?}, got {}",
                seen.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn bodies(messages: &[Message]) -> Vec<String> { messages.iter().map(Message::body_string).collect() }
