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

use std::sync::Arc;

use tokio::sync::Notify;

/// Cheap, cloneable reference to a spawned worker.
#[derive(Clone)]
pub struct WorkerHandle {
    name:   Arc<str>,
    notify: Arc<Notify>,
}

impl WorkerHandle {
    pub(crate) const fn new(name: Arc<str>, notify: Arc<Notify>) -> Self { Self { name, notify } }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Wake the worker. Has an effect only for notify-driven triggers; a
    /// notification sent while the worker is busy is kept for its next wait.
    pub fn notify(&self) { self.notify.notify_one(); }

    /// The notifier backing this handle, for sharing with producers of work.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> { self.notify.clone() }
}
