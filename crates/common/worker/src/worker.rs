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

use crate::{context::WorkerContext, err::WorkResult};

/// A unit of background work.
///
/// The manager calls [`Worker::work`] every time the worker's trigger fires.
/// A transient error is logged and the worker keeps running; a fatal error
/// stops it after [`Worker::on_shutdown`].
#[async_trait::async_trait]
pub trait Worker: Send + 'static {
    /// Runs once before the first `work` call. An error here stops the worker
    /// without calling `on_shutdown`.
    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkResult { Ok(()) }

    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult;

    /// Runs once after the last `work` call, also when the worker was
    /// cancelled. Not called if the task is aborted.
    async fn on_shutdown(&mut self, _ctx: &WorkerContext) -> WorkResult { Ok(()) }
}
