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

//! Storage backend seam.
//!
//! Producers and consumers talk to a [`Driver`]; the registry picks the
//! implementation from the `driver` setting. Only the disk driver exists.

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::{runtime::Handle, sync::Notify};

use crate::{
    config::QueueConfig,
    disk::DiskDriver,
    error::{ConfigSnafu, Result},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DriverKind {
    Disk,
}

/// A queue backend shared by every producer and consumer of a registry.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> DriverKind;

    /// Accept a message for `topic`. The returned message carries its
    /// offset. Blocks while a full batch is written.
    fn produce(&self, topic: &str, id: String, body: Bytes) -> Result<Message>;

    /// Hold a message back for `delay`. The returned message has no offset
    /// yet; one is assigned on release.
    fn produce_delayed(&self, topic: &str, id: String, body: Bytes, delay: Duration) -> Result<Message>;

    /// Open a cursor for `group` on `topic`, resuming from the group's last
    /// commit.
    fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;

    /// Flush buffers, persist delayed messages and stop background work.
    async fn shutdown(&self) -> Result<()>;
}

/// One consumer group's position in one topic.
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    fn group(&self) -> &str;

    /// Offset the next [`poll`](Subscription::poll) returns.
    fn next_offset(&self) -> u64;

    /// Next committed message, or `None` when caught up.
    fn poll(&mut self) -> Result<Option<Message>>;

    /// Persist the position so a restart resumes after the last polled
    /// message.
    fn commit(&mut self) -> Result<()>;

    /// Woken whenever new messages become readable.
    fn notifier(&self) -> Arc<Notify>;
}

/// Build the driver named in the configuration.
pub(crate) fn open_driver(config: &QueueConfig, runtime: Handle) -> Result<Arc<dyn Driver>> {
    let kind = DriverKind::from_str(&config.driver).map_err(|_| {
        ConfigSnafu {
            message: format!("unknown queue driver '{}'", config.driver),
        }
        .build()
    })?;
    match kind {
        DriverKind::Disk => Ok(Arc::new(DiskDriver::open(config.disk.clone(), runtime)?)),
    }
}
