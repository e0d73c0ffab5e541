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

//! Type-state builder for spawning workers.
//!
//! `spawn` only exists once a trigger has been chosen:
//! `TriggerNotSet` → `once()/on_notify()/interval()/interval_or_notify()` →
//! `TriggerSet` → `spawn()`.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use tokio::sync::Notify;

use crate::{handle::WorkerHandle, manager::Manager, trigger::Trigger, worker::Worker};

/// No trigger chosen yet.
pub struct TriggerNotSet;
/// Ready to spawn.
pub struct TriggerSet;

pub struct WorkerBuilder<'m, W, T> {
    manager:  &'m Manager,
    worker:   W,
    name:     Option<String>,
    notify:   Option<Arc<Notify>>,
    trigger:  Option<Trigger>,
    _phantom: PhantomData<T>,
}

impl<'m, W: Worker, T> WorkerBuilder<'m, W, T> {
    /// Name used in logs and metric labels. Defaults to the worker's type name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Wake the worker through an existing notifier instead of a fresh one.
    #[must_use]
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    fn with_trigger(self, trigger: Trigger) -> WorkerBuilder<'m, W, TriggerSet> {
        WorkerBuilder {
            manager:  self.manager,
            worker:   self.worker,
            name:     self.name,
            notify:   self.notify,
            trigger:  Some(trigger),
            _phantom: PhantomData,
        }
    }
}

impl<'m, W: Worker> WorkerBuilder<'m, W, TriggerNotSet> {
    pub(crate) const fn new(manager: &'m Manager, worker: W) -> Self {
        Self {
            manager,
            worker,
            name: None,
            notify: None,
            trigger: None,
            _phantom: PhantomData,
        }
    }

    pub fn once(self) -> WorkerBuilder<'m, W, TriggerSet> { self.with_trigger(Trigger::Once) }

    pub fn on_notify(self) -> WorkerBuilder<'m, W, TriggerSet> { self.with_trigger(Trigger::Notify) }

    pub fn interval(self, period: Duration) -> WorkerBuilder<'m, W, TriggerSet> {
        self.with_trigger(Trigger::Interval(period))
    }

    pub fn interval_or_notify(self, period: Duration) -> WorkerBuilder<'m, W, TriggerSet> {
        self.with_trigger(Trigger::IntervalOrNotify(period))
    }
}

impl<W: Worker> WorkerBuilder<'_, W, TriggerSet> {
    /// Start the worker on the manager's runtime.
    pub fn spawn(self) -> WorkerHandle {
        let name = self
            .name
            .unwrap_or_else(|| short_type_name::<W>().to_owned());
        let notify = self.notify.unwrap_or_default();
        let trigger = self.trigger.unwrap_or(Trigger::Once);
        self.manager.spawn_worker(self.worker, name.into(), trigger, notify)
    }
}

fn short_type_name<W>() -> &'static str {
    let full = std::any::type_name::<W>();
    full.rsplit("::").next().unwrap_or(full)
}
