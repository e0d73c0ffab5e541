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

use tokio::time::{Interval, MissedTickBehavior};

use crate::{context::WorkerContext, trigger::Trigger};

/// Turns a [`Trigger`] into a sequence of wake-ups.
pub(crate) enum TriggerDriver {
    Once { fired: bool },
    Notify,
    Interval(Interval),
    IntervalOrNotify(Interval),
}

impl TriggerDriver {
    pub(crate) fn new(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Once => Self::Once { fired: false },
            Trigger::Notify => Self::Notify,
            Trigger::Interval(period) => Self::Interval(skipping_interval(period)),
            Trigger::IntervalOrNotify(period) => Self::IntervalOrNotify(skipping_interval(period)),
        }
    }

    /// Wait for the next execution. Returns `false` once the worker should
    /// stop.
    pub(crate) async fn wait_next(&mut self, ctx: &WorkerContext) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        match self {
            Self::Once { fired } => {
                if *fired {
                    ctx.cancelled().await;
                    false
                } else {
                    *fired = true;
                    true
                }
            }
            Self::Notify => tokio::select! {
                () = ctx.notified() => true,
                () = ctx.cancelled() => false,
            },
            Self::Interval(interval) => tokio::select! {
                _ = interval.tick() => true,
                () = ctx.cancelled() => false,
            },
            Self::IntervalOrNotify(interval) => tokio::select! {
                _ = interval.tick() => true,
                () = ctx.notified() => {
                    interval.reset();
                    true
                }
                () = ctx.cancelled() => false,
            },
        }
    }
}

fn skipping_interval(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
