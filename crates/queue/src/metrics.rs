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
    HistogramVec, IntCounterVec, IntGauge, exponential_buckets, register_histogram_vec, register_int_counter_vec,
    register_int_gauge,
};

use crate::error::QueueError;

pub const TOPIC_LABEL: &str = "topic";
pub const GROUP_LABEL: &str = "group";
pub const KIND_LABEL: &str = "kind";

pub static MESSAGES_PRODUCED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_messages_produced_total",
        "Messages accepted into a topic buffer",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static MESSAGES_DELAYED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_messages_delayed_total",
        "Messages handed to the delay scheduler",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static MESSAGES_RELEASED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_messages_released_total",
        "Delayed messages moved into their topic buffer",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static DELAY_PENDING: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("zqueue_delay_pending", "Delayed messages waiting for release").unwrap()
});

pub static MESSAGES_CONSUMED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_messages_consumed_total",
        "Messages a handler accepted",
        &[TOPIC_LABEL, GROUP_LABEL]
    )
    .unwrap()
});

pub static HANDLER_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_handler_failures_total",
        "Messages a handler rejected; the offset still advances",
        &[TOPIC_LABEL, GROUP_LABEL]
    )
    .unwrap()
});

pub static FLUSHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("zqueue_flushes_total", "Batches appended to a topic log", &[TOPIC_LABEL]).unwrap()
});

pub static FLUSH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_flush_failures_total",
        "Batch appends that failed",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static FLUSH_BATCH_SIZE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "zqueue_flush_batch_size",
        "Records per flushed batch",
        &[TOPIC_LABEL],
        exponential_buckets(1.0, 2.0, 12).unwrap()
    )
    .unwrap()
});

pub static SEGMENTS_ROLLED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_segments_rolled_total",
        "Segments sealed because they were full",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static SEGMENTS_EVICTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "zqueue_segments_evicted_total",
        "Segments deleted by retention",
        &[TOPIC_LABEL]
    )
    .unwrap()
});

pub static ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("zqueue_errors_total", "Errors returned to callers", &[KIND_LABEL]).unwrap()
});

/// Count an error on its way back to the caller.
pub(crate) fn record_error(err: &QueueError) { ERRORS.with_label_values(&[err.kind().as_ref()]).inc(); }
