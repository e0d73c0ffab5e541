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

use std::sync::LazyLock;

use prometheus::{
    HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec,
};

pub const WORKER_LABEL: &str = "worker";

pub static WORKER_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_worker_started_total",
        "Workers started",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_STOPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_worker_stopped_total",
        "Workers that returned, successfully or not",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_worker_failed_total",
        "Workers stopped by a fatal error",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_EXECUTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_worker_executions_total",
        "Successful work executions",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_EXECUTION_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_worker_execution_errors_total",
        "Failed work executions",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "zqueue_worker_active",
        "Running workers",
        &[WORKER_LABEL]
    )
    .unwrap()
});

pub static WORKER_EXECUTION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "zqueue_worker_execution_duration_seconds",
        "Duration of one work execution",
        &[WORKER_LABEL]
    )
    .unwrap()
});
