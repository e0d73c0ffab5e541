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

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use snafu::ensure;
use uuid::Uuid;

use crate::{
    driver::Driver,
    error::{ClosedSnafu, Result, ValidationSnafu},
    message::Message,
    metrics::record_error,
};

/// Sends messages to topics. Cheap to clone; every clone for a group is the
/// same instance.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    group:  String,
    driver: Arc<dyn Driver>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("group", &self.inner.group)
            .field("driver", &self.inner.driver.kind())
            .finish()
    }
}

impl Producer {
    pub(crate) fn new(group: String, driver: Arc<dyn Driver>, closed: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(ProducerInner { group, driver, closed }),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str { &self.inner.group }

    /// Whether both handles refer to the same producer.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    /// Send a text message.
    pub fn send_msg(&self, topic: &str, body: &str) -> Result<Message> {
        self.send_byte_msg(topic, body.to_owned())
    }

    /// Send a raw message. The returned message carries its id and offset.
    pub fn send_byte_msg(&self, topic: &str, body: impl Into<Bytes>) -> Result<Message> {
        let body = body.into();
        self.observe(|| self.inner.driver.produce(topic, new_id(), body))
    }

    /// Send a text message that becomes readable after `delay_seconds`.
    ///
    /// A zero delay sends right away. Otherwise the returned message has no
    /// offset yet ([`Message::UNASSIGNED_OFFSET`]).
    pub fn send_delay_msg(&self, topic: &str, body: &str, delay_seconds: i64) -> Result<Message> {
        self.observe(|| {
            ensure!(
                delay_seconds >= 0,
                ValidationSnafu {
                    message: format!("delay must not be negative, got {delay_seconds}s"),
                }
            );
            let body = Bytes::copy_from_slice(body.as_bytes());
            match delay_seconds.unsigned_abs() {
                0 => self.inner.driver.produce(topic, new_id(), body),
                secs => self
                    .inner
                    .driver
                    .produce_delayed(topic, new_id(), body, Duration::from_secs(secs)),
            }
        })
    }

    fn observe(&self, send: impl FnOnce() -> Result<Message>) -> Result<Message> {
        let result = if self.inner.closed.load(Ordering::Acquire) {
            ClosedSnafu.fail()
        } else {
            send()
        };
        if let Err(err) = &result {
            record_error(err);
        }
        result
    }
}

fn new_id() -> String { Uuid::new_v4().to_string() }
