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
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use snafu::ensure;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::QueueConfig,
    consumer::{Consumer, ConsumerHandler},
    driver::{Driver, open_driver},
    error::{ClosedSnafu, ConfigSnafu, Result},
    metrics::record_error,
    producer::Producer,
    topic::validate_group_name,
};

/// Entry point of the queue. Owns the driver and hands out one producer and
/// one consumer per group.
///
/// Create it once at startup and pass it to the code that sends or consumes.
pub struct Registry {
    config:       QueueConfig,
    runtime:      Handle,
    instances:    Mutex<Instances>,
    driver_inits: AtomicUsize,
    closed:       Arc<AtomicBool>,
}

#[derive(Default)]
struct Instances {
    driver:    Option<Arc<dyn Driver>>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Validate `config` and bind the registry to the current tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            ConfigSnafu {
                message: format!("the queue must be created inside a tokio runtime: {err}"),
            }
            .build()
        })?;
        Self::with_runtime(config, runtime)
    }

    /// Like [`Registry::new`] with an explicit runtime for background work.
    pub fn with_runtime(config: QueueConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        info!(
            switch = config.switch,
            driver = %config.driver,
            group = %config.group_name,
            path = ?config.disk.path,
            "Queue registry created"
        );
        Ok(Self {
            config,
            runtime,
            instances: Mutex::new(Instances::default()),
            driver_inits: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig { &self.config }

    /// The producer for `group`, created on first request.
    pub fn producer(&self, group: &str) -> Result<Producer> {
        observe(|| {
            let mut instances = self.instances.lock();
            self.ensure_usable(group)?;
            if let Some(producer) = instances.producers.get(group) {
                return Ok(producer.clone());
            }
            let driver = self.driver(&mut instances)?;
            let producer = Producer::new(group.to_owned(), driver, self.closed.clone());
            instances.producers.insert(group.to_owned(), producer.clone());
            info!(group, "Producer created");
            Ok(producer)
        })
    }

    /// The consumer for `group`, created on first request.
    pub fn consumer(&self, group: &str) -> Result<Consumer> {
        observe(|| {
            let mut instances = self.instances.lock();
            self.ensure_usable(group)?;
            if let Some(consumer) = instances.consumers.get(group) {
                return Ok(consumer.clone());
            }
            validate_group_name(group)?;
            let driver = self.driver(&mut instances)?;
            let consumer = Consumer::new(
                group.to_owned(),
                driver,
                self.runtime.clone(),
                &self.config.disk,
                self.closed.clone(),
            );
            instances.consumers.insert(group.to_owned(), consumer.clone());
            info!(group, "Consumer created");
            Ok(consumer)
        })
    }

    /// Producer for the configured `groupName`.
    pub fn default_producer(&self) -> Result<Producer> { self.producer(&self.config.group_name) }

    /// Consumer for the configured `groupName`.
    pub fn default_consumer(&self) -> Result<Consumer> { self.consumer(&self.config.group_name) }

    /// How many times a driver has been constructed. Never more than one.
    #[must_use]
    pub fn driver_initializations(&self) -> usize { self.driver_inits.load(Ordering::Acquire) }

    /// Register `handlers` on the default consumer group and start its
    /// listeners.
    pub fn start_consumers_listener(
        &self,
        ctx: CancellationToken,
        handlers: Vec<Arc<dyn ConsumerHandler>>,
    ) -> Result<Consumer> {
        let consumer = self.default_consumer()?;
        for handler in handlers {
            consumer.register_consumer(handler)?;
        }
        consumer.start_consumers_listener(ctx)?;
        Ok(consumer)
    }

    /// Stop accepting sends, flush every buffer, persist delayed messages and
    /// stop the listeners. Later calls return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down queue registry");

        let (driver, consumers) = {
            let instances = self.instances.lock();
            (
                instances.driver.clone(),
                instances.consumers.values().cloned().collect::<Vec<_>>(),
            )
        };

        let result = match driver {
            Some(driver) => driver.shutdown().await,
            None => Ok(()),
        };
        for consumer in consumers {
            consumer.shutdown().await;
        }

        match &result {
            Ok(()) => info!("Queue registry shut down"),
            Err(err) => record_error(err),
        }
        result
    }

    fn ensure_usable(&self, group: &str) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);
        ensure!(
            self.config.switch,
            ConfigSnafu {
                message: "the queue is switched off",
            }
        );
        ensure!(
            !group.is_empty(),
            ConfigSnafu {
                message: "group name is empty",
            }
        );
        Ok(())
    }

    /// The shared driver, built on first use under the instance lock.
    fn driver(&self, instances: &mut Instances) -> Result<Arc<dyn Driver>> {
        if let Some(driver) = &instances.driver {
            return Ok(driver.clone());
        }
        let driver = open_driver(&self.config, self.runtime.clone())?;
        self.driver_inits.fetch_add(1, Ordering::AcqRel);
        info!(kind = %driver.kind(), "Queue driver initialised");
        instances.driver = Some(driver.clone());
        Ok(driver)
    }
}

fn observe<T>(op: impl FnOnce() -> Result<T>) -> Result<T> {
    let result = op();
    if let Err(err) = &result {
        record_error(err);
    }
    result
}
