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

use snafu::Snafu;
use zqueue_common_storage_log::LogError;
use zqueue_common_worker::WorkError;

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Error returned by a [`ConsumerHandler`](crate::ConsumerHandler).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse error class, also used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    ValidationError,
    IoError,
    CorruptionError,
    Closed,
    ShutdownTimeout,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    #[snafu(display("Invalid queue configuration: {message}"))]
    Config {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Failed to load queue configuration"))]
    LoadConfig {
        source: config::ConfigError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Queue configuration rejected: {source}"))]
    InvalidOptions {
        source: validator::ValidationErrors,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("No tokio runtime available for queue workers"))]
    NoRuntime {
        source: WorkError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Rejected input: {message}"))]
    Validation {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Storage failure on topic '{topic}'"))]
    Storage {
        topic:  String,
        source: LogError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to persist pending delayed messages"))]
    DelayPersist {
        source: LogError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to encode pending delayed messages"))]
    DelayEncode {
        source: bincode::error::EncodeError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Pending delay log is unreadable"))]
    DelayDecode {
        source: bincode::error::DecodeError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Queue is shut down"))]
    Closed {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display(
        "Shutdown did not finish within {timeout:?}: {discarded} buffered records discarded, {in_flight} \
         topics still flushing"
    ))]
    ShutdownTimeout {
        timeout:   Duration,
        discarded: usize,
        /// Topics whose final flush was still running; their records may
        /// still reach disk.
        in_flight: usize,
        #[snafu(implicit)]
        loc:       snafu::Location,
    },
}

impl QueueError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::LoadConfig { .. } | Self::InvalidOptions { .. } | Self::NoRuntime { .. } => {
                ErrorKind::ConfigError
            }
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::Storage { source, .. } => match source {
                LogError::RecordTooLarge { .. } => ErrorKind::ValidationError,
                other if other.is_corruption() => ErrorKind::CorruptionError,
                _ => ErrorKind::IoError,
            },
            Self::DelayPersist { .. } | Self::DelayEncode { .. } => ErrorKind::IoError,
            Self::DelayDecode { .. } => ErrorKind::CorruptionError,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::ShutdownTimeout { .. } => ErrorKind::ShutdownTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use snafu::IntoError;

    use super::*;

    fn storage(source: LogError) -> QueueError {
        StorageSnafu { topic: "orders" }.into_error(source)
    }

    #[test]
    fn test_storage_kinds() {
        let too_large = storage(
            zqueue_common_storage_log::error::RecordTooLargeSnafu {
                size:     2048_u64,
                capacity: 960_u64,
            }
            .build(),
        );
        assert_eq!(too_large.kind(), ErrorKind::ValidationError);

        let torn = storage(
            zqueue_common_storage_log::error::CorruptedRecordSnafu {
                offset: 7_u64,
                reason: "bad crc",
            }
            .build(),
        );
        assert_eq!(torn.kind(), ErrorKind::CorruptionError);

        let io = storage(
            zqueue_common_storage_log::error::IoSnafu {
                path: PathBuf::from("/nope"),
            }
            .into_error(std::io::Error::other("denied")),
        );
        assert_eq!(io.kind(), ErrorKind::IoError);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::ConfigError.as_ref(), "config_error");
        assert_eq!(ErrorKind::IoError.to_string(), "io_error");
        assert_eq!(ClosedSnafu.build().kind(), ErrorKind::Closed);
    }
}
