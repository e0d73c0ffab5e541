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
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use snafu::{ResultExt, ensure};
use tracing::info;
use zqueue_common_storage_log::TopicLog;
use zqueue_common_worker::Manager;

use crate::{
    batcher::{BatchFlusher, Batcher},
    config::DiskConfig,
    error::{Result, StorageSnafu, ValidationSnafu},
};

const MAX_NAME_LEN: usize = 200;

/// A topic's log plus the buffer feeding it.
pub(crate) struct Topic {
    name:    String,
    log:     Arc<TopicLog>,
    batcher: Arc<Batcher>,
}

impl Topic {
    /// Open (or create) `<root>/<name>` and recover its log.
    pub(crate) fn open(root: &Path, name: &str, disk: &DiskConfig) -> Result<Self> {
        let log = TopicLog::open(root.join(name), name, disk.log_config()).context(StorageSnafu { topic: name })?;
        let log = Arc::new(log);
        info!(
            topic = name,
            next_offset = log.next_offset(),
            earliest_offset = log.earliest_offset(),
            segments = log.segments().len(),
            "Topic opened"
        );
        Ok(Self {
            name: name.to_owned(),
            batcher: Arc::new(Batcher::new(log.clone(), disk)),
            log,
        })
    }

    pub(crate) fn name(&self) -> &str { &self.name }

    pub(crate) const fn log(&self) -> &Arc<TopicLog> { &self.log }

    pub(crate) const fn batcher(&self) -> &Arc<Batcher> { &self.batcher }
}

/// Open topics by name. A topic is opened on first use and gets its own
/// flush worker.
pub(crate) struct TopicTable {
    root:    PathBuf,
    disk:    DiskConfig,
    workers: Arc<Manager>,
    topics:  RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicTable {
    pub(crate) fn new(disk: DiskConfig, workers: Arc<Manager>) -> Self {
        Self {
            root: disk.path.clone(),
            disk,
            workers,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_open(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(topic.clone());
        }
        validate_topic_name(name)?;

        let mut topics = self.topics.write();
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Arc::new(Topic::open(&self.root, name, &self.disk)?);
        self.workers
            .worker(BatchFlusher::new(topic.batcher().clone()))
            .name(format!("flush-{name}"))
            .with_notify(topic.batcher().flusher_notify())
            .on_notify()
            .spawn();
        topics.insert(name.to_owned(), topic.clone());
        Ok(topic)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Topic>> { self.topics.read().values().cloned().collect() }
}

/// Topic names become directory names and group names file names, so only
/// a safe character set is allowed and a leading dot (reserved for engine
/// state) is refused.
pub(crate) fn validate_topic_name(name: &str) -> Result<()> { validate_name("topic", name) }

pub(crate) fn validate_group_name(name: &str) -> Result<()> { validate_name("group", name) }

fn validate_name(what: &str, name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        ValidationSnafu {
            message: format!("{what} name is empty"),
        }
    );
    ensure!(
        name.len() <= MAX_NAME_LEN,
        ValidationSnafu {
            message: format!("{what} name longer than {MAX_NAME_LEN} bytes"),
        }
    );
    ensure!(
        !name.starts_with('.'),
        ValidationSnafu {
            message: format!("{what} name '{name}' starts with a dot"),
        }
    );
    ensure!(
        name.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        ValidationSnafu {
            message: format!("{what} name '{name}' may only contain ASCII letters, digits, '-', '_' and '.'"),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("login_log" ; "underscore")]
    #[test_case("user.login-v2" ; "dot and dash")]
    #[test_case("A1" ; "short")]
    fn test_valid_topic_names(name: &str) { validate_topic_name(name).unwrap(); }

    #[test_case("" ; "empty")]
    #[test_case(".delay" ; "reserved prefix")]
    #[test_case("a/b" ; "path separator")]
    #[test_case("..\\x" ; "windows separator")]
    #[test_case("caf\u{e9}" ; "non ascii")]
    fn test_invalid_topic_names(name: &str) {
        let err = validate_topic_name(name).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationError);
    }

    #[test]
    fn test_overlong_topic_name() { assert!(validate_topic_name(&"t".repeat(MAX_NAME_LEN + 1)).is_err()); }

    #[test]
    fn test_group_error_names_the_group() {
        let err = validate_group_name("").unwrap_err();
        assert!(err.to_string().contains("group name is empty"));
    }
}
