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

//! One listener task per (topic, group).
//!
//! ```text
//! Stopped -> Starting -> Idle <-> Dispatching -> Draining -> Stopped
//! ```
//!
//! The listener wakes on every flush of its topic and on a polling
//! interval, hands each readable message to the handler, and commits the
//! group's position after each pass. Handler failures are logged and the
//! position still moves past the message.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{AsRefStr, Display};
use tracing::{error, info, warn};
use zqueue_common_worker::{WorkError, WorkResult, Worker, WorkerContext};

use crate::{
    consumer::{ConsumerHandler, HandlerContext},
    driver::Subscription,
    error::ErrorKind,
    metrics::{HANDLER_FAILURES, MESSAGES_CONSUMED, record_error},
};

/// Messages handled per wake-up before yielding.
const MAX_PER_PASS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, IntoPrimitive, TryFromPrimitive)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ListenerState {
    Stopped     = 0,
    Starting    = 1,
    /// Running, caught up with the topic.
    Idle        = 2,
    /// Running, a handler call is in flight.
    Dispatching = 3,
    /// Cancelled; the last position is being committed.
    Draining    = 4,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ListenerState) -> Self { Self(AtomicU8::new(state.into())) }

    pub(crate) fn get(&self) -> ListenerState {
        ListenerState::try_from(self.0.load(Ordering::Acquire)).unwrap_or(ListenerState::Stopped)
    }

    pub(crate) fn set(&self, state: ListenerState) { self.0.store(state.into(), Ordering::Release); }
}

pub(crate) struct Listener {
    handler:      Arc<dyn ConsumerHandler>,
    subscription: Box<dyn Subscription>,
    state:        Arc<StateCell>,
    ctx:          HandlerContext,
}

impl Listener {
    pub(crate) fn new(
        handler: Arc<dyn ConsumerHandler>,
        subscription: Box<dyn Subscription>,
        state: Arc<StateCell>,
        ctx: HandlerContext,
    ) -> Self {
        Self {
            handler,
            subscription,
            state,
            ctx,
        }
    }

    fn commit(&mut self) -> WorkResult {
        self.subscription.commit().map_err(|err| {
            record_error(&err);
            WorkError::transient_with_source("checkpoint commit failed", err)
        })
    }
}

#[async_trait]
impl Worker for Listener {
    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkResult {
        self.state.set(ListenerState::Idle);
        info!(
            topic = self.subscription.topic(),
            group = self.subscription.group(),
            offset = self.subscription.next_offset(),
            "Listener started"
        );
        Ok(())
    }

    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult {
        let topic = self.subscription.topic().to_owned();
        let group = self.subscription.group().to_owned();
        let labels = [topic.as_str(), group.as_str()];
        let mut dispatched = 0usize;
        let mut read_failure = None;

        while dispatched < MAX_PER_PASS && !ctx.is_cancelled() {
            let message = match self.subscription.poll() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    record_error(&err);
                    warn!(topic = %topic, group = %group, error = %err, "Read failed");
                    // A damaged segment has been skipped; keep reading.
                    if err.kind() == ErrorKind::CorruptionError {
                        continue;
                    }
                    read_failure = Some(err);
                    break;
                }
            };

            self.state.set(ListenerState::Dispatching);
            let offset = message.offset;
            match self.handler.handle(&self.ctx, message).await {
                Ok(()) => MESSAGES_CONSUMED.with_label_values(&labels).inc(),
                Err(err) => {
                    HANDLER_FAILURES.with_label_values(&labels).inc();
                    error!(
                        topic = %topic,
                        group = %group,
                        offset,
                        error = %err,
                        "Handler failed, moving past the message"
                    );
                }
            }
            self.state.set(ListenerState::Idle);
            dispatched += 1;
        }

        if dispatched == MAX_PER_PASS {
            // More may be waiting; run again without waiting for the interval.
            self.subscription.notifier().notify_one();
        }

        self.commit()?;
        match read_failure {
            Some(err) => Err(WorkError::transient_with_source("reading the topic failed", err)),
            None => Ok(()),
        }
    }

    async fn on_shutdown(&mut self, _ctx: &WorkerContext) -> WorkResult {
        self.state.set(ListenerState::Draining);
        let result = self.commit();
        self.state.set(ListenerState::Stopped);
        info!(
            topic = self.subscription.topic(),
            group = self.subscription.group(),
            offset = self.subscription.next_offset(),
            "Listener stopped"
        );
        result
    }
}
