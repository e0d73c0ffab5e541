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

//! Background workers driven by triggers.
//!
//! A [`Worker`] only implements one unit of work. The [`Manager`] owns the
//! loop around it: it waits for the configured [`Trigger`], calls
//! [`Worker::work`], and on shutdown cancels every worker and waits for
//! them within a deadline before aborting the stragglers.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use zqueue_common_worker::{Manager, ManagerConfig, WorkResult, Worker, WorkerContext};
//!
//! struct Compactor;
//!
//! #[async_trait::async_trait]
//! impl Worker for Compactor {
//!     async fn work(&mut self, ctx: &WorkerContext) -> WorkResult {
//!         tracing::info!(worker = ctx.name(), "compacting");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> WorkResult {
//! let manager = Manager::start(ManagerConfig::builder().build())?;
//! let handle = manager
//!     .worker(Compactor)
//!     .name("compactor")
//!     .interval_or_notify(Duration::from_secs(5))
//!     .spawn();
//! handle.notify();
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod context;
mod driver;
mod err;
mod handle;
mod manager;
mod metrics;
mod trigger;
mod worker;

pub use builder::{TriggerNotSet, TriggerSet, WorkerBuilder};
pub use config::ManagerConfig;
pub use context::WorkerContext;
pub use err::{ErrorSeverity, WorkError, WorkResult};
pub use handle::WorkerHandle;
pub use manager::Manager;
pub use trigger::Trigger;
pub use worker::Worker;
