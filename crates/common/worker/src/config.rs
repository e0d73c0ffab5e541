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

use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Settings for a [`Manager`](crate::Manager).
#[derive(Debug, Clone, bon::Builder)]
pub struct ManagerConfig {
    /// Runtime the workers are spawned on. Defaults to the runtime that
    /// calls [`Manager::start`](crate::Manager::start).
    runtime: Option<Handle>,

    /// Workers are also cancelled when this token is.
    parent: Option<CancellationToken>,

    /// How long shutdown waits before aborting workers.
    #[builder(default = Duration::from_secs(30))]
    shutdown_timeout: Duration,
}

impl ManagerConfig {
    pub(crate) fn runtime(&self) -> Option<Handle> { self.runtime.clone() }

    pub(crate) fn parent(&self) -> Option<CancellationToken> { self.parent.clone() }

    pub(crate) const fn shutdown_timeout(&self) -> Duration { self.shutdown_timeout }
}
