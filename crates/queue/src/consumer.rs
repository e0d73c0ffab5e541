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
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::{ResultExt, ensure};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zqueue_common_worker::{Manager, ManagerConfig};

use crate::{
    config::DiskConfig,
    driver::{Driver, Subscription},
    error::{BoxError, ClosedSnafu, ConfigSnafu, NoRuntimeSnafu, Result},
    listener::{Listener, ListenerState, StateCell},
    message::Message,
    metrics::record_error,
    topic::validate_topic_name,
};

/// Application code that processes one topic.
#[async_trait]
pub trait ConsumerHandler: Send + Sync + 'static {
    /// Topic this handler consumes.
    fn topic(&self) -> &str;

    /// Process one message. An error is logged and the message is not
    /// redelivered.
    async fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<(), BoxError>;
}

/// What a handler knows about the listener calling it.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    topic:  String,
    group:  String,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub(crate) const fn new(topic: String, group: String, cancel: CancellationToken) -> Self {
        Self { topic, group, cancel }
    }

    #[must_use]
    pub fn topic(&self) -> &str { &self.topic }

    #[must_use]
    pub fn group(&self) -> &str { &self.group }

    /// Set once the listener is shutting down. Long-running handlers should
    /// wrap up.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    pub async fn cancelled(&self) { self.cancel.cancelled().await }
}

/// A consumer group. Handlers are registered first, then
/// [`start_consumers_listener`](Consumer::start_consumers_listener) starts one
/// listener per handler.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    group:            String,
    driver:           Arc<dyn Driver>,
    runtime:          Handle,
    poll_interval:    Duration,
    shutdown_timeout: Duration,
    closed:           Arc<AtomicBool>,
    handlers:         Mutex<Vec<Arc<dyn ConsumerHandler>>>,
    listeners:        Mutex<Option<ListenerSet>>,
}

struct ListenerSet {
    manager: Arc<Manager>,
    states:  Vec<(String, Arc<StateCell>)>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let started = self.inner.listeners.lock().is_some();
        let handlers = self.inner.handlers.lock().len();
        f.debug_struct("Consumer")
            .field("group", &self.inner.group)
            .field("handlers", &handlers)
            .field("started", &started)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub(crate) fn new(
        group: String,
        driver: Arc<dyn Driver>,
        runtime: Handle,
        disk: &DiskConfig,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                group,
                driver,
                runtime,
                poll_interval: disk.poll_interval,
                shutdown_timeout: disk.shutdown_timeout,
                closed,
                handlers: Mutex::new(Vec::new()),
                listeners: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str { &self.inner.group }

    /// Whether both handles refer to the same consumer.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    /// Add a handler. Only allowed before the listeners start.
    pub fn register_consumer(&self, handler: Arc<dyn ConsumerHandler>) -> Result<()> {
        let result = self.register(handler);
        if let Err(err) = &result {
            record_error(err);
        }
        result
    }

    fn register(&self, handler: Arc<dyn ConsumerHandler>) -> Result<()> {
        ensure!(!self.inner.closed.load(Ordering::Acquire), ClosedSnafu);
        ensure!(
            self.inner.listeners.lock().is_none(),
            ConfigSnafu {
                message: format!(
                    "group '{}' already started its listeners; register handlers before starting",
                    self.inner.group
                ),
            }
        );
        validate_topic_name(handler.topic())?;
        info!(group = %self.inner.group, topic = handler.topic(), "Consumer registered");
        self.inner.handlers.lock().push(handler);
        Ok(())
    }

    /// Start one listener per registered handler.
    ///
    /// Listeners stop when `ctx` is cancelled or on [`Consumer::shutdown`].
    /// Fails when two handlers consume the same topic or when called twice.
    pub fn start_consumers_listener(&self, ctx: CancellationToken) -> Result<()> {
        let result = self.start(ctx);
        if let Err(err) = &result {
            record_error(err);
        }
        result
    }

    fn start(&self, ctx: CancellationToken) -> Result<()> {
        ensure!(!self.inner.closed.load(Ordering::Acquire), ClosedSnafu);
        let group = &self.inner.group;
        let mut listeners = self.inner.listeners.lock();
        ensure!(
            listeners.is_none(),
            ConfigSnafu {
                message: format!("listeners for group '{group}' are already running"),
            }
        );

        let handlers = self.inner.handlers.lock().clone();
        let mut topics = HashSet::new();
        for handler in &handlers {
            ensure!(
                topics.insert(handler.topic()),
                ConfigSnafu {
                    message: format!(
                        "topic '{}' has more than one handler in group '{group}'",
                        handler.topic()
                    ),
                }
            );
        }

        // Subscribe everything before spawning so a failure starts nothing.
        let subscriptions = handlers
            .iter()
            .map(|handler| self.inner.driver.subscribe(handler.topic(), group))
            .collect::<Result<Vec<Box<dyn Subscription>>>>()?;

        let manager = Manager::start(
            ManagerConfig::builder()
                .runtime(self.inner.runtime.clone())
                .parent(ctx)
                .shutdown_timeout(self.inner.shutdown_timeout)
                .build(),
        )
        .context(NoRuntimeSnafu)?;
        let manager = Arc::new(manager);

        let mut states = Vec::with_capacity(handlers.len());
        for (handler, subscription) in handlers.into_iter().zip(subscriptions) {
            let topic = handler.topic().to_owned();
            let state = Arc::new(StateCell::new(ListenerState::Starting));
            let notify = subscription.notifier();
            let handler_ctx = HandlerContext::new(topic.clone(), group.clone(), manager.cancel_token().child_token());
            manager
                .worker(Listener::new(handler, subscription, state.clone(), handler_ctx))
                .name(format!("listen-{topic}-{group}"))
                .with_notify(notify)
                .interval_or_notify(self.inner.poll_interval)
                .spawn();
            states.push((topic, state));
        }

        info!(group = %group, listeners = states.len(), "Consumer listeners started");
        *listeners = Some(ListenerSet { manager, states });
        Ok(())
    }

    /// State of each listener by topic, in registration order. Empty before
    /// the listeners start.
    #[must_use]
    pub fn listener_states(&self) -> Vec<(String, ListenerState)> {
        self.inner
            .listeners
            .lock()
            .as_ref()
            .map(|set| {
                set.states
                    .iter()
                    .map(|(topic, state)| (topic.clone(), state.get()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop the listeners, letting in-flight handler calls finish.
    pub async fn shutdown(&self) {
        let manager = self
            .inner
            .listeners
            .lock()
            .as_ref()
            .map(|set| set.manager.clone());
        if let Some(manager) = manager {
            manager.shutdown().await;
            info!(group = %self.inner.group, "Consumer listeners stopped");
        }
    }
}
