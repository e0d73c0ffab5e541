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

use std::path::PathBuf;

use snafu::Snafu;

/// Errors raised by the segmented log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LogError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io {
        path:   PathBuf,
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed on {}: {message}", path.display()))]
    MmapFailed {
        path:    PathBuf,
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    /// Invalid or inaccessible file path.
    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath {
        path: PathBuf,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    /// A segment header could not be decoded.
    #[snafu(display("Unreadable segment header in {}: {reason}", path.display()))]
    SegmentHeader {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A committed record failed its CRC or framing checks.
    #[snafu(display("Corrupted record at offset {offset}: {reason}"))]
    CorruptedRecord {
        offset: u64,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The record can never fit into a segment.
    #[snafu(display("Record of {size} bytes exceeds segment capacity of {capacity} bytes"))]
    RecordTooLarge {
        size:     u64,
        capacity: u64,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// The record cannot be framed (for example an id longer than the
    /// length field allows).
    #[snafu(display("Invalid record at offset {offset}: {reason}"))]
    InvalidRecord {
        offset: u64,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Appended offsets must continue the log without gaps.
    #[snafu(display("Offset gap: expected {expected}, got {actual}"))]
    OffsetGap {
        expected: u64,
        actual:   u64,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// A dual-slot state file is damaged in both slots.
    #[snafu(display("State file {} is corrupted: {reason}", path.display()))]
    SlotCorrupted {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

impl LogError {
    /// Whether the error reports on-disk corruption rather than an I/O fault.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SegmentHeader { .. } | Self::CorruptedRecord { .. } | Self::SlotCorrupted { .. }
        )
    }
}

/// Result type for log operations.
pub type Result<T, E = LogError> = std::result::Result<T, E>;
