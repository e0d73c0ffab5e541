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

//! Segmented, memory-mapped append-only log.
//!
//! Each topic lives in its own directory as a sequence of fixed-size segment
//! files named after the first offset they hold. Exactly one segment is
//! writable; the others are sealed. Retention removes the oldest sealed
//! segments, and recovery rebuilds the segment list on open, cutting off a
//! torn tail left by a crash.
//!
//! - [`TopicLog`]: single-writer append path, roll and retention
//! - [`Tailer`]: per-subscriber reader over committed records
//! - [`SlotFile`]: small crash-safe state files (checkpoints, snapshots)

mod crc;
mod recovery;
mod segment;

pub mod config;
pub mod error;
pub mod file;
pub mod path;
pub mod record;
pub mod slot_file;
pub mod tailer;
pub mod topic_log;

pub use config::{FlushMode, LogConfig, RollStrategy};
pub use error::{LogError, Result};
pub use file::{DataFile, ReadOnlyDataFile};
pub use record::{Record, record_disk_size};
pub use recovery::RecoveryReport;
pub use segment::{SEGMENT_HEADER_SIZE, SegmentHeader, SegmentInfo};
pub use slot_file::SlotFile;
pub use tailer::Tailer;
pub use topic_log::{AppendStats, Located, TopicLog};
