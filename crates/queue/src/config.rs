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

//! Queue configuration.
//!
//! Read from the `[queue]` table of a TOML file, then overridden by
//! `ZQUEUE`-prefixed environment variables (`__` separates nested keys).
//! Keys are camelCase; the `config` crate lowercases keys, so every field
//! also accepts its lowercase spelling.

use std::{fmt, path::PathBuf, time::Duration};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use smart_default::SmartDefault;
use snafu::ResultExt;
use tracing::warn;
use validator::{Validate, ValidationError};
use zqueue_common_storage_log::{LogConfig, RollStrategy};

use crate::error::{InvalidOptionsSnafu, LoadConfigSnafu, Result};

const ENV_PREFIX: &str = "ZQUEUE";
const TABLE: &str = "queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SmartDefault, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Master switch. When off, the registry refuses to hand out producers
    /// and consumers.
    #[default = true]
    pub switch: bool,

    #[default = "disk"]
    pub driver: String,

    /// Group used by `default_producer` / `default_consumer`.
    #[default = "default"]
    #[serde(alias = "groupname")]
    #[validate(length(min = 1))]
    pub group_name: String,

    #[validate(nested)]
    pub disk: DiskConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SmartDefault, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskConfig {
    /// Root directory; each topic gets a sub-directory.
    #[default(PathBuf::from("./tmp/diskqueue"))]
    #[validate(custom(function = "non_empty_path"))]
    pub path: PathBuf,

    /// Buffered records that force a flush.
    #[default = 100]
    #[serde(alias = "batchsize")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Longest time a record waits in the buffer.
    #[default(Duration::from_secs(1))]
    #[serde(alias = "batchtime", with = "seconds")]
    #[validate(custom(function = "non_zero_duration"))]
    pub batch_time: Duration,

    /// Segment file size in bytes, header included.
    #[default = 10_485_760]
    #[serde(alias = "segmentsize", alias = "segmentSizeBytes", alias = "segmentsizebytes")]
    #[validate(custom(function = "segment_size_fits_a_record"))]
    pub segment_size: u64,

    /// Segments kept per topic, the active one included.
    #[default = 3000]
    #[serde(alias = "segmentlimit")]
    #[validate(range(min = 1))]
    pub segment_limit: usize,

    /// Optional record-count cap per segment.
    #[serde(alias = "maxrecordspersegment")]
    #[validate(range(min = 1))]
    pub max_records_per_segment: Option<u64>,

    #[serde(alias = "flushmode")]
    pub flush_mode: FlushMode,

    /// Listener polling period when no commit notification arrives.
    #[default(Duration::from_millis(100))]
    #[serde(alias = "pollinterval", with = "seconds")]
    #[validate(custom(function = "non_zero_duration"))]
    pub poll_interval: Duration,

    #[default(Duration::from_secs(30))]
    #[serde(alias = "shutdowntimeout", with = "seconds")]
    pub shutdown_timeout: Duration,

    /// Buffer cap, in multiples of `batchSize`, while flushes keep failing.
    #[default = 16]
    #[serde(alias = "maxpendingfactor")]
    #[validate(range(min = 1))]
    pub max_pending_factor: usize,
}

/// Durability of each flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Leave write-back to the OS.
    #[default]
    Async,
    /// msync every batch before the send returns.
    Sync,
}

impl From<FlushMode> for zqueue_common_storage_log::FlushMode {
    fn from(mode: FlushMode) -> Self {
        match mode {
            FlushMode::Async => Self::Async,
            FlushMode::Sync => Self::Sync,
        }
    }
}

impl QueueConfig {
    /// Load from an optional TOML file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::from_layers(builder.build().context(LoadConfigSnafu)?)
    }

    /// Load from an in-memory TOML document, without the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let layers = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context(LoadConfigSnafu)?;
        Self::from_layers(layers)
    }

    fn from_layers(layers: Config) -> Result<Self> {
        match layers.get::<Self>(TABLE) {
            Ok(config) => Ok(config),
            Err(config::ConfigError::NotFound(_)) => {
                warn!("No [queue] configuration found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err).context(LoadConfigSnafu),
        }
    }

    pub fn validate(&self) -> Result<()> { Validate::validate(self).context(InvalidOptionsSnafu) }
}

impl DiskConfig {
    /// Storage settings for one topic log.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            segment_size:  self.segment_size,
            segment_limit: self.segment_limit,
            roll_strategy: self
                .max_records_per_segment
                .map_or(RollStrategy::BySize, RollStrategy::ByCount),
            flush_mode:    self.flush_mode.into(),
        }
    }

    /// Most records buffered per topic before sends fail.
    #[must_use]
    pub const fn max_pending(&self) -> usize { self.batch_size.saturating_mul(self.max_pending_factor) }
}

fn non_empty_path(path: &PathBuf) -> std::result::Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::new("empty_path"));
    }
    Ok(())
}

fn non_zero_duration(duration: &Duration) -> std::result::Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

fn segment_size_fits_a_record(size: &u64) -> std::result::Result<(), ValidationError> {
    if *size < LogConfig::min_segment_size() {
        return Err(ValidationError::new("segment_too_small"));
    }
    Ok(())
}

/// Durations written as (possibly fractional) seconds.
mod seconds {
    use super::{Deserializer, Duration, Serializer, de, fmt};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(SecondsVisitor)
    }

    struct SecondsVisitor;

    impl de::Visitor<'_> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> { Ok(Duration::from_secs(v)) }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(|_| E::invalid_value(de::Unexpected::Float(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            let secs: f64 = v
                .trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))?;
            self.visit_f64(secs)
        }
    }
}
