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

//! Sequential reader over a [`TopicLog`].
//!
//! The [`Tailer`] keeps its own read-only mapping of the segment it is
//! reading and only looks at bytes the log has published, so it never sees
//! a half-written batch. Sealed segments are read first, then the committed
//! part of the active segment. When the requested offset has been evicted by
//! retention the tailer jumps forward to the oldest offset still on disk.

use std::sync::Arc;

use snafu::ensure;
use tracing::warn;

use crate::{
    Result,
    error::CorruptedRecordSnafu,
    file::ReadOnlyDataFile,
    record::Record,
    segment::{SEGMENT_HEADER_SIZE, SegmentInfo, read_record_at},
    topic_log::{Located, TopicLog},
};

struct OpenSegment {
    file:        ReadOnlyDataFile,
    base_offset: u64,
    /// Byte position of the record carrying `offset`.
    position:    u64,
    offset:      u64,
}

/// A cursor reading records in offset order.
///
/// Tailers are cheap; each subscriber owns one.
pub struct Tailer {
    log:         Arc<TopicLog>,
    next_offset: u64,
    current:     Option<OpenSegment>,
}

impl Tailer {
    /// Create a tailer whose first read returns `offset`.
    #[must_use]
    pub fn from_offset(log: Arc<TopicLog>, offset: u64) -> Self {
        Self {
            log,
            next_offset: offset,
            current: None,
        }
    }

    /// Create a tailer at the oldest offset still on disk.
    #[must_use]
    pub fn from_earliest(log: Arc<TopicLog>) -> Self {
        let offset = log.earliest_offset();
        Self::from_offset(log, offset)
    }

    /// Offset the next successful read returns.
    #[must_use]
    pub const fn next_offset(&self) -> u64 { self.next_offset }

    #[must_use]
    pub fn log(&self) -> &Arc<TopicLog> { &self.log }

    /// Move the cursor.
    pub fn seek(&mut self, offset: u64) {
        self.next_offset = offset;
        self.current = None;
    }

    /// Read the next committed record.
    ///
    /// Returns `Ok(None)` when the reader has caught up with the writer.
    pub fn read_next(&mut self) -> Result<Option<Record>> {
        loop {
            let info = match self.log.locate(self.next_offset) {
                Located::Pending => return Ok(None),
                Located::Skipped { resume_at } => {
                    warn!(
                        topic = self.log.name(),
                        requested = self.next_offset,
                        resume_at,
                        "Offsets no longer on disk, skipping ahead"
                    );
                    self.seek(resume_at);
                    continue;
                }
                Located::Segment(info) => info,
            };

            if self
                .current
                .as_ref()
                .is_none_or(|current| current.base_offset != info.base_offset)
            {
                match ReadOnlyDataFile::open(&info.path) {
                    Ok(file) => {
                        self.current = Some(OpenSegment {
                            file,
                            base_offset: info.base_offset,
                            position: SEGMENT_HEADER_SIZE as u64,
                            offset: info.base_offset,
                        });
                    }
                    // Evicted between locate and open; locate again.
                    Err(_) if !matches!(self.log.locate(self.next_offset), Located::Segment(_)) => continue,
                    Err(err) => return Err(err),
                }
            }

            return self.read_in_segment(&info);
        }
    }

    /// Skip the rest of the segment holding the next offset.
    ///
    /// Used after a corrupted record so the reader can make progress.
    pub fn skip_segment(&mut self) {
        if let Located::Segment(info) = self.log.locate(self.next_offset) {
            warn!(
                topic = self.log.name(),
                from = self.next_offset,
                to = info.end_offset(),
                "Skipping damaged segment"
            );
            self.seek(info.end_offset());
        }
    }

    fn read_in_segment(&mut self, info: &SegmentInfo) -> Result<Option<Record>> {
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };

        // Walk forward from the last known position to the wanted offset.
        if current.offset > self.next_offset {
            current.position = SEGMENT_HEADER_SIZE as u64;
            current.offset = info.base_offset;
        }
        while current.offset < self.next_offset {
            let Some((_, next)) = read_record_at(&current.file, current.position, info.size_bytes)? else {
                return Ok(None);
            };
            current.position = next;
            current.offset += 1;
        }

        let Some((record, next)) = read_record_at(&current.file, current.position, info.size_bytes)? else {
            return Ok(None);
        };
        ensure!(
            record.offset == self.next_offset,
            CorruptedRecordSnafu {
                offset: self.next_offset,
                reason: format!("found record for offset {} instead", record.offset),
            }
        );

        current.position = next;
        current.offset += 1;
        self.next_offset += 1;
        Ok(Some(record))
    }
}

impl Iterator for Tailer {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> { self.read_next().transpose() }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::LogConfig;

    fn open_log(dir: &TempDir, segment_limit: usize) -> Arc<TopicLog> {
        let config = LogConfig {
            segment_size: 1024,
            segment_limit,
            ..LogConfig::default()
        };
        Arc::new(TopicLog::open(dir.path(), "orders", config).unwrap())
    }

    fn append(log: &TopicLog, count: u64) {
        let start = log.next_offset();
        let records: Vec<Record> = (start..start + count)
            .map(|offset| Record {
                offset,
                timestamp: i64::try_from(offset).unwrap(),
                run_type: 1,
                id: format!("id-{offset}"),
                body: Bytes::from(format!("body-{offset:0>90}")),
            })
            .collect();
        log.append_batch(&records).unwrap();
    }

    #[test]
    fn test_reads_across_segments_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(&temp_dir, 100);
        append(&log, 20);
        assert!(log.segments().len() > 1);

        let offsets: Vec<u64> = Tailer::from_earliest(log)
            .map(|record| record.unwrap().offset)
            .collect();
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_catches_up_then_sees_new_appends() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(&temp_dir, 100);
        let mut tailer = Tailer::from_offset(log.clone(), 0);
        assert!(tailer.read_next().unwrap().is_none());

        append(&log, 2);
        assert_eq!(tailer.read_next().unwrap().unwrap().offset, 0);
        assert_eq!(tailer.read_next().unwrap().unwrap().offset, 1);
        assert!(tailer.read_next().unwrap().is_none());
    }

    #[test]
    fn test_seek_into_middle_of_segment() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(&temp_dir, 100);
        append(&log, 5);

        let mut tailer = Tailer::from_offset(log, 3);
        let record = tailer.read_next().unwrap().unwrap();
        assert_eq!(record.offset, 3);
        assert_eq!(record.id, "id-3");

        tailer.seek(1);
        assert_eq!(tailer.read_next().unwrap().unwrap().offset, 1);
    }

    #[test]
    fn test_evicted_offsets_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(&temp_dir, 2);
        append(&log, 30);

        let earliest = log.earliest_offset();
        assert!(earliest > 0);

        let mut tailer = Tailer::from_offset(log, 0);
        assert_eq!(tailer.read_next().unwrap().unwrap().offset, earliest);
    }
}
