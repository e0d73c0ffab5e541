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

//! Segment header format and record scanning.
//!
//! ## Header Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                        │
//! ├──────────────────────┬───────────────────────────────────┤
//! │ magic: [u8; 4]       │ "ZQSG"                            │
//! │ version: u32         │ Format version, currently 1       │
//! │ base_offset: u64     │ Offset of the first record        │
//! │ header_crc: u32      │ CRC32 of the 16 bytes above       │
//! │ flags: u32           │ bit 0 = sealed                    │
//! │ sealed_size: u64     │ Bytes used, header included       │
//! │ record_count: u64    │ Records in a sealed segment       │
//! │ seal_crc: u32        │ CRC32 of flags..record_count      │
//! │ reserved: [u8; 20]   │                                   │
//! └──────────────────────┴───────────────────────────────────┘
//! ```
//!
//! The identity part (magic, version, base offset) is written once at
//! creation. The seal part is written when the segment is sealed and carries
//! its own checksum, so a torn seal write only downgrades the segment to
//! "unsealed" and recovery scans it instead.

use std::path::{Path, PathBuf};

use snafu::ensure;

use crate::{
    Result,
    crc::checksum,
    error::{CorruptedRecordSnafu, SegmentHeaderSnafu},
    file::{DataFile, ReadOnlyDataFile},
    record::{RECORD_LENGTH_SIZE, Record},
};

/// Magic bytes identifying a segment file: "ZQSG".
pub const SEGMENT_MAGIC: [u8; 4] = *b"ZQSG";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 64;

const FLAG_SEALED: u32 = 1;

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub base_offset:  u64,
    pub sealed:       bool,
    pub sealed_size:  u64,
    pub record_count: u64,
}

impl SegmentHeader {
    #[must_use]
    pub const fn unsealed(base_offset: u64) -> Self {
        Self {
            base_offset,
            sealed: false,
            sealed_size: 0,
            record_count: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.base_offset.to_le_bytes());
        let header_crc = checksum(&buf[0..16]);
        buf[16..20].copy_from_slice(&header_crc.to_le_bytes());

        if self.sealed {
            buf[20..24].copy_from_slice(&FLAG_SEALED.to_le_bytes());
            buf[24..32].copy_from_slice(&self.sealed_size.to_le_bytes());
            buf[32..40].copy_from_slice(&self.record_count.to_le_bytes());
            let seal_crc = checksum(&buf[20..40]);
            buf[40..44].copy_from_slice(&seal_crc.to_le_bytes());
        }
        buf
    }

    /// Decode a header read from `path`.
    ///
    /// Fails when the identity part is damaged. A damaged seal part yields an
    /// unsealed header.
    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE], path: &Path) -> Result<Self> {
        ensure!(
            buf[0..4] == SEGMENT_MAGIC,
            SegmentHeaderSnafu {
                path:   path.to_path_buf(),
                reason: "bad magic".to_string(),
            }
        );
        let version = u32_at(buf, 4);
        ensure!(
            version == SEGMENT_VERSION,
            SegmentHeaderSnafu {
                path:   path.to_path_buf(),
                reason: format!("unsupported version {version}"),
            }
        );
        ensure!(
            checksum(&buf[0..16]) == u32_at(buf, 16),
            SegmentHeaderSnafu {
                path:   path.to_path_buf(),
                reason: "header checksum mismatch".to_string(),
            }
        );

        let base_offset = u64_at(buf, 8);
        let flags = u32_at(buf, 20);
        let seal_intact = checksum(&buf[20..40]) == u32_at(buf, 40);
        if flags & FLAG_SEALED != 0 && seal_intact {
            Ok(Self {
                base_offset,
                sealed: true,
                sealed_size: u64_at(buf, 24),
                record_count: u64_at(buf, 32),
            })
        } else {
            Ok(Self::unsealed(base_offset))
        }
    }
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(out)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(out)
}

/// Reader-visible state of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path:         PathBuf,
    pub base_offset:  u64,
    /// Committed bytes, header included.
    pub size_bytes:   u64,
    pub record_count: u64,
    pub sealed:       bool,
}

impl SegmentInfo {
    /// Offset one past the last committed record.
    #[must_use]
    pub const fn end_offset(&self) -> u64 { self.base_offset + self.record_count }

    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.end_offset()
    }
}

/// Positional reads shared by the writable and read-only mappings.
pub(crate) trait ReadAt {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn size(&self) -> u64;
}

impl ReadAt for DataFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> { Self::read_at(self, offset, buf) }

    fn size(&self) -> u64 { Self::size(self) }
}

impl ReadAt for ReadOnlyDataFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> { Self::read_at(self, offset, buf) }

    fn size(&self) -> u64 { Self::size(self) }
}

pub(crate) fn read_header<F: ReadAt>(file: &F, path: &Path) -> Result<SegmentHeader> {
    ensure!(
        file.size() >= SEGMENT_HEADER_SIZE as u64,
        SegmentHeaderSnafu {
            path:   path.to_path_buf(),
            reason: format!("file of {} bytes is shorter than a header", file.size()),
        }
    );
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    file.read_at(0, &mut buf)?;
    SegmentHeader::decode(&buf, path)
}

/// Create a segment file and write its unsealed header.
pub(crate) fn create_segment(path: &Path, base_offset: u64, size: u64) -> Result<DataFile> {
    let file = DataFile::create(path, size)?;
    file.write_at(0, &SegmentHeader::unsealed(base_offset).encode())?;
    file.flush_range(0, SEGMENT_HEADER_SIZE as u64)?;
    Ok(file)
}

/// Write the seal part of the header and flush the whole segment.
pub(crate) fn seal_segment(file: &DataFile, info: &SegmentInfo) -> Result<()> {
    let header = SegmentHeader {
        base_offset:  info.base_offset,
        sealed:       true,
        sealed_size:  info.size_bytes,
        record_count: info.record_count,
    };
    file.write_at(0, &header.encode())?;
    file.flush_all()
}

/// Read the record starting at `position`, never looking past `limit`.
///
/// Returns `Ok(None)` at the end of written data.
pub(crate) fn read_record_at<F: ReadAt>(
    file: &F,
    position: u64,
    limit: u64,
) -> Result<Option<(Record, u64)>> {
    let limit = limit.min(file.size());
    if position + RECORD_LENGTH_SIZE as u64 > limit {
        return Ok(None);
    }

    let mut length_buf = [0u8; RECORD_LENGTH_SIZE];
    file.read_at(position, &mut length_buf)?;
    let length = u32::from_le_bytes(length_buf);
    if length == 0 {
        return Ok(None);
    }

    let frame_start = position + RECORD_LENGTH_SIZE as u64;
    let next = frame_start + u64::from(length);
    ensure!(
        next <= limit,
        CorruptedRecordSnafu {
            offset: position,
            reason: format!("record of {length} bytes overruns segment end {limit}"),
        }
    );

    let mut frame = vec![0u8; length as usize];
    file.read_at(frame_start, &mut frame)?;
    let record = Record::decode(length, &frame, position)?;
    Ok(Some((record, next)))
}

/// Result of scanning an unsealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanOutcome {
    /// Position just past the last valid record.
    pub end:          u64,
    pub record_count: u64,
    /// Whether invalid bytes were found after `end`.
    pub torn:         bool,
}

/// Walk records from the header onwards until the data ends or stops being
/// valid. Offsets must continue from `base_offset` without gaps.
pub(crate) fn scan_segment<F: ReadAt>(file: &F, base_offset: u64) -> ScanOutcome {
    let mut position = SEGMENT_HEADER_SIZE as u64;
    let mut count = 0;
    loop {
        match read_record_at(file, position, file.size()) {
            Ok(Some((record, next))) if record.offset == base_offset + count => {
                position = next;
                count += 1;
            }
            Ok(Some(_)) | Err(_) => {
                return ScanOutcome {
                    end:          position,
                    record_count: count,
                    torn:         true,
                };
            }
            Ok(None) => {
                return ScanOutcome {
                    end:          position,
                    record_count: count,
                    torn:         false,
                };
            }
        }
    }
}
