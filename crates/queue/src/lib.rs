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

//! Disk-backed, topic-addressed message queue for a single process.
//!
//! Messages are appended to per-topic segment files in batches, consumed
//! by per-group listeners that survive restarts, and can be delayed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use zqueue::{BoxError, ConsumerHandler, HandlerContext, Message, QueueConfig, Registry};
//!
//! struct LoginLog;
//!
//! #[async_trait]
//! impl ConsumerHandler for LoginLog {
//!     fn topic(&self) -> &str { "login_log" }
//!
//!     async fn handle(&self, _ctx: &HandlerContext, message: Message) -> Result<(), BoxError> {
//!         println!("{}", message.body_string());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> zqueue::Result<()> {
//! let registry = Registry::new(QueueConfig::load(Some("config/app.toml"))?)?;
//! let shutdown = CancellationToken::new();
//! registry.start_consumers_listener(shutdown.clone(), vec![Arc::new(LoginLog)])?;
//!
//! let producer = registry.default_producer()?;
//! producer.send_msg("login_log", "alice signed in")?;
//! producer.send_delay_msg("login_log", "reminder", 30)?;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod batcher;
mod consumer;
mod delay;
mod disk;
mod driver;
mod listener;
mod producer;
mod registry;
mod topic;

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;

pub use config::{DiskConfig, FlushMode, QueueConfig};
pub use consumer::{Consumer, ConsumerHandler, HandlerContext};
pub use driver::{Driver, DriverKind, Subscription};
pub use error::{BoxError, ErrorKind, QueueError, Result};
pub use listener::ListenerState;
pub use message::{Message, RunType};
pub use producer::Producer;
pub use registry::Registry;
