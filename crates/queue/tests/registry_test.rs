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

mod common;

use std::{sync::Arc, thread};

use common::{Collector, config};
use tempfile::TempDir;
use test_case::test_case;
use tokio_util::sync::CancellationToken;
use zqueue::{ErrorKind, QueueConfig, Registry};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producer_requests_share_one_instance() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Arc::new(Registry::new(config(&temp_dir)).unwrap());

    let producers: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || registry.producer("writers").unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(producers.iter().all(|p| p.same_instance(&producers[0])));
    assert_eq!(producers[0].group(), "writers");

    // Other groups and consumers share the same driver.
    let other = registry.producer("readers").unwrap();
    assert!(!other.same_instance(&producers[0]));
    let consumer = registry.consumer("writers").unwrap();
    assert!(consumer.same_instance(&registry.consumer("writers").unwrap()));
    assert_eq!(registry.driver_initializations(), 1);

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_default_group_comes_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();

    let producer = registry.default_producer().unwrap();
    assert_eq!(producer.group(), "tests");
    assert!(producer.same_instance(&registry.producer("tests").unwrap()));
    assert_eq!(registry.default_consumer().unwrap().group(), "tests");

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_group_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();

    assert_eq!(registry.producer("").unwrap_err().kind(), ErrorKind::ConfigError);
    assert_eq!(registry.consumer("").unwrap_err().kind(), ErrorKind::ConfigError);
    assert_eq!(registry.driver_initializations(), 0);
}

#[tokio::test]
async fn test_unknown_driver_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(QueueConfig {
        driver: "kafka".to_owned(),
        ..config(&temp_dir)
    })
    .unwrap();

    assert_eq!(registry.producer("g").unwrap_err().kind(), ErrorKind::ConfigError);
    assert_eq!(registry.driver_initializations(), 0);
}

#[tokio::test]
async fn test_switched_off_queue_hands_out_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(QueueConfig {
        switch: false,
        ..config(&temp_dir)
    })
    .unwrap();

    assert_eq!(registry.default_producer().unwrap_err().kind(), ErrorKind::ConfigError);
    assert_eq!(registry.default_consumer().unwrap_err().kind(), ErrorKind::ConfigError);
}

#[test]
fn test_registry_needs_a_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let err = Registry::new(config(&temp_dir)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[tokio::test]
async fn test_invalid_options_are_rejected_up_front() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir);
    config.disk.batch_size = 0;
    assert_eq!(Registry::new(config).unwrap_err().kind(), ErrorKind::ConfigError);
}

#[test_case("" ; "empty topic")]
#[test_case("../escape" ; "path traversal")]
#[test_case(".delay" ; "reserved name")]
#[tokio::test]
async fn test_bad_topic_is_a_validation_error(topic: &str) {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();
    let producer = registry.default_producer().unwrap();

    assert_eq!(producer.send_msg(topic, "x").unwrap_err().kind(), ErrorKind::ValidationError);
    assert_eq!(
        producer.send_delay_msg(topic, "x", 5).unwrap_err().kind(),
        ErrorKind::ValidationError
    );
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_negative_delay_is_a_validation_error() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();

    let err = registry
        .default_producer()
        .unwrap()
        .send_delay_msg("orders", "x", -1)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_message_is_a_validation_error() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir);
    config.disk.segment_size = 1024;
    let registry = Registry::new(config).unwrap();

    let err = registry
        .default_producer()
        .unwrap()
        .send_byte_msg("orders", vec![7u8; 2048])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_handlers_for_one_topic_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();

    let (first, _) = Collector::new("orders");
    let (second, _) = Collector::new("orders");
    let err = registry
        .start_consumers_listener(CancellationToken::new(), vec![first, second])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_after_start_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();

    let (first, _) = Collector::new("orders");
    let consumer = registry
        .start_consumers_listener(CancellationToken::new(), vec![first])
        .unwrap();

    let (late, _) = Collector::new("payments");
    assert_eq!(consumer.register_consumer(late).unwrap_err().kind(), ErrorKind::ConfigError);
    assert_eq!(
        consumer
            .start_consumers_listener(CancellationToken::new())
            .unwrap_err()
            .kind(),
        ErrorKind::ConfigError
    );
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_new_work_and_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(config(&temp_dir)).unwrap();
    let producer = registry.default_producer().unwrap();
    producer.send_msg("orders", "before").unwrap();

    registry.shutdown().await.unwrap();
    registry.shutdown().await.unwrap();

    assert_eq!(producer.send_msg("orders", "after").unwrap_err().kind(), ErrorKind::Closed);
    assert_eq!(
        producer.send_delay_msg("orders", "after", 3).unwrap_err().kind(),
        ErrorKind::Closed
    );
    assert_eq!(registry.default_producer().unwrap_err().kind(), ErrorKind::Closed);
}
