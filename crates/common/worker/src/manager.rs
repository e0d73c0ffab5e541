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
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    builder::{TriggerNotSet, WorkerBuilder},
    config::ManagerConfig,
    context::WorkerContext,
    driver::TriggerDriver,
    err::{WorkError, WorkResult},
    handle::WorkerHandle,
    metrics::{
        WORKER_ACTIVE, WORKER_EXECUTION_DURATION_SECONDS, WORKER_EXECUTION_ERRORS, WORKER_EXECUTIONS,
        WORKER_FAILED, WORKER_STARTED, WORKER_STOPPED,
    },
    trigger::Trigger,
    worker::Worker,
};

/// Owns a group of background workers and their shutdown.
pub struct Manager {
    cancel_token:     CancellationToken,
    runtime:          Handle,
    shutdown_timeout: Duration,
    joins:            Mutex<JoinSet<WorkResult>>,
    spawned:          AtomicUsize,
    shut_down:        AtomicBool,
}

impl Manager {
    /// Create a manager. Fails when no runtime was configured and the caller
    /// is not inside one.
    pub fn start(config: ManagerConfig) -> WorkResult<Self> {
        let runtime = match config.runtime() {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| WorkError::fatal_with_source("no tokio runtime to spawn workers on", e))?,
        };
        let cancel_token = config
            .parent()
            .map_or_else(CancellationToken::new, |parent| parent.child_token());

        Ok(Self {
            cancel_token,
            runtime,
            shutdown_timeout: config.shutdown_timeout(),
            joins: Mutex::new(JoinSet::new()),
            spawned: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start configuring a worker.
    pub fn worker<W: Worker>(&self, worker: W) -> WorkerBuilder<'_, W, TriggerNotSet> {
        WorkerBuilder::new(self, worker)
    }

    /// Number of workers spawned so far.
    #[must_use]
    pub fn worker_count(&self) -> usize { self.spawned.load(Ordering::Acquire) }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken { self.cancel_token.clone() }

    #[must_use]
    pub const fn runtime(&self) -> &Handle { &self.runtime }

    pub(crate) fn spawn_worker<W: Worker>(
        &self,
        worker: W,
        name: Arc<str>,
        trigger: Trigger,
        notify: Arc<Notify>,
    ) -> WorkerHandle {
        let ctx = WorkerContext::new(name.clone(), self.cancel_token.child_token(), notify.clone());
        self.joins.lock().spawn_on(run_worker(worker, ctx, trigger), &self.runtime);
        self.spawned.fetch_add(1, Ordering::AcqRel);
        debug!(worker = %name, ?trigger, "Worker spawned");
        WorkerHandle::new(name, notify)
    }

    /// Cancel every worker and wait for them.
    ///
    /// Workers still running after the shutdown timeout are aborted. Calling
    /// this more than once is harmless.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(workers = self.worker_count(), "Shutting down worker manager");
        self.cancel_token.cancel();

        let mut joins = std::mem::take(&mut *self.joins.lock());
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut stopped = 0usize;
        let mut aborted = 0usize;

        loop {
            tokio::select! {
                next = joins.join_next() => match next {
                    Some(Ok(Ok(()))) => stopped += 1,
                    Some(Ok(Err(err))) => {
                        stopped += 1;
                        warn!(error = %err, "Worker ended with an error");
                    }
                    Some(Err(join_err)) => {
                        if join_err.is_cancelled() {
                            aborted += 1;
                        } else {
                            error!(error = %join_err, "Worker task panicked");
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => {
                    warn!(timeout = ?self.shutdown_timeout, "Shutdown timeout reached, aborting remaining workers");
                    joins.abort_all();
                    while let Some(next) = joins.join_next().await {
                        match next {
                            Err(join_err) if join_err.is_cancelled() => aborted += 1,
                            _ => stopped += 1,
                        }
                    }
                    break;
                }
            }
        }

        if aborted > 0 {
            error!(stopped, aborted, "Worker manager shutdown complete");
        } else {
            info!(stopped, "Worker manager shutdown complete");
        }
    }
}

async fn run_worker<W: Worker>(mut worker: W, ctx: WorkerContext, trigger: Trigger) -> WorkResult {
    let name = ctx.name().to_owned();
    let labels = [name.as_str()];
    info!(worker = %name, ?trigger, "Worker starting");
    WORKER_STARTED.with_label_values(&labels).inc();
    WORKER_ACTIVE.with_label_values(&labels).inc();

    if let Err(err) = worker.on_start(&ctx).await {
        error!(worker = %name, error = %err, "Worker failed to start");
        WORKER_FAILED.with_label_values(&labels).inc();
        WORKER_ACTIVE.with_label_values(&labels).dec();
        return Err(err);
    }

    let mut driver = TriggerDriver::new(trigger);
    let result = loop {
        if !driver.wait_next(&ctx).await {
            break Ok(());
        }
        let started = Instant::now();
        match worker.work(&ctx).await {
            Ok(()) => {
                WORKER_EXECUTIONS.with_label_values(&labels).inc();
                WORKER_EXECUTION_DURATION_SECONDS
                    .with_label_values(&labels)
                    .observe(started.elapsed().as_secs_f64());
            }
            Err(err) if err.is_transient() => {
                warn!(worker = %name, error = %err, "Work failed, will retry on next trigger");
                WORKER_EXECUTION_ERRORS.with_label_values(&labels).inc();
            }
            Err(err) => {
                error!(worker = %name, error = %err, "Work failed fatally, stopping worker");
                WORKER_EXECUTION_ERRORS.with_label_values(&labels).inc();
                break Err(err);
            }
        }
    };

    if let Err(err) = worker.on_shutdown(&ctx).await {
        error!(worker = %name, error = %err, "Worker shutdown hook failed");
    }

    if result.is_err() {
        WORKER_FAILED.with_label_values(&labels).inc();
    }
    WORKER_STOPPED.with_label_values(&labels).inc();
    WORKER_ACTIVE.with_label_values(&labels).dec();
    info!(worker = %name, "Worker stopped");
    result
}
