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

//! The per-topic segmented log.
//!
//! A [`TopicLog`] owns an ordered list of segments. The last one is the
//! active segment unless it is sealed, in which case a new active segment is
//! created on the next append. Appends are serialised by a writer mutex;
//! readers only take the metadata read lock long enough to copy the
//! [`SegmentInfo`] they need, so reads never wait on disk writes.
//!
//! Written bytes become visible to readers only once [`TopicLog::append_batch`]
//! publishes the new committed size. A failed append rolls the writer back to
//! the last published state.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, ensure};
use tracing::{debug, error, info, warn};

use crate::{
    LogConfig, Result,
    error::{IoSnafu, OffsetGapSnafu, RecordTooLargeSnafu},
    file::DataFile,
    path::segment_file_path,
    record::Record,
    recovery::{RecoveryReport, recover},
    segment::{SEGMENT_HEADER_SIZE, SegmentInfo, create_segment, seal_segment},
};

/// Published, reader-visible state.
#[derive(Debug, Default)]
struct LogMeta {
    segments:    VecDeque<SegmentInfo>,
    next_offset: u64,
}

struct ActiveSegment {
    file: DataFile,
    /// Write-side view, ahead of the published one while a batch is written.
    info: SegmentInfo,
}

struct Writer {
    active:      Option<ActiveSegment>,
    next_offset: u64,
}

/// What one [`TopicLog::append_batch`] call did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppendStats {
    pub appended: usize,
    pub bytes:    u64,
    /// Base offsets of segments sealed during the append.
    pub sealed:   Vec<u64>,
    /// Base offsets of segments removed by retention.
    pub evicted:  Vec<u64>,
}

/// Where a reader finds an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// The offset is committed in this segment.
    Segment(SegmentInfo),
    /// The offset is no longer on disk; reading resumes at `resume_at`.
    Skipped { resume_at: u64 },
    /// The offset has not been written yet.
    Pending,
}

/// Append-only segmented log for one topic.
pub struct TopicLog {
    name:   String,
    dir:    PathBuf,
    config: LogConfig,
    writer: Mutex<Writer>,
    meta:   RwLock<LogMeta>,
}

impl TopicLog {
    /// Open the log stored in `dir`, recovering whatever is on disk.
    pub fn open<P: AsRef<Path>>(dir: P, name: impl Into<String>, config: LogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let name = name.into();
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;

        let recovered = recover(&dir)?;
        log_recovery(&name, &recovered.report);

        let active = recovered.active.map(|file| {
            let info = recovered
                .segments
                .back()
                .cloned()
                .unwrap_or_else(|| empty_info(file.path(), recovered.next_offset));
            ActiveSegment { file, info }
        });

        let log = Self {
            name,
            dir,
            writer: Mutex::new(Writer {
                active,
                next_offset: recovered.next_offset,
            }),
            meta: RwLock::new(LogMeta {
                segments:    recovered.segments,
                next_offset: recovered.next_offset,
            }),
            config,
        };

        let evicted = log.enforce_retention();
        if !evicted.is_empty() {
            info!(topic = %log.name, evicted = evicted.len(), "Retention applied after recovery");
        }
        Ok(log)
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    pub fn dir(&self) -> &Path { &self.dir }

    #[must_use]
    pub const fn config(&self) -> &LogConfig { &self.config }

    /// Offset the next appended record must carry.
    #[must_use]
    pub fn next_offset(&self) -> u64 { self.meta.read().next_offset }

    /// Oldest offset still on disk.
    #[must_use]
    pub fn earliest_offset(&self) -> u64 {
        let meta = self.meta.read();
        meta.segments
            .front()
            .map_or(meta.next_offset, |segment| segment.base_offset)
    }

    /// Snapshot of the segment list, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> { self.meta.read().segments.iter().cloned().collect() }

    /// Find the committed segment holding `offset`.
    #[must_use]
    pub fn locate(&self, offset: u64) -> Located {
        let meta = self.meta.read();
        if offset >= meta.next_offset {
            return Located::Pending;
        }
        let idx = meta
            .segments
            .partition_point(|segment| segment.base_offset <= offset);
        if idx == 0 {
            let resume_at = meta
                .segments
                .front()
                .map_or(meta.next_offset, |segment| segment.base_offset);
            return Located::Skipped { resume_at };
        }
        let segment = &meta.segments[idx - 1];
        if segment.contains(offset) {
            Located::Segment(segment.clone())
        } else {
            let resume_at = meta
                .segments
                .get(idx)
                .map_or(meta.next_offset, |next| next.base_offset);
            Located::Skipped { resume_at }
        }
    }

    /// Append records whose offsets continue the log.
    ///
    /// Rolls to a new segment whenever the roll strategy requires it and
    /// applies retention after each roll. On failure nothing past the last
    /// published record is visible; records committed by a roll earlier in
    /// the same call stay committed, and callers can tell which ones by
    /// checking [`TopicLog::next_offset`].
    pub fn append_batch(&self, records: &[Record]) -> Result<AppendStats> {
        let mut stats = AppendStats::default();
        if records.is_empty() {
            return Ok(stats);
        }

        let mut writer = self.writer.lock();
        let result = self
            .write_records(&mut writer, records, &mut stats)
            .and_then(|()| self.commit(&writer));
        if let Err(err) = result {
            error!(topic = %self.name, error = %err, "Append failed, rolling writer back");
            self.rollback(&mut writer);
            return Err(err);
        }

        debug!(
            topic = %self.name,
            records = stats.appended,
            bytes = stats.bytes,
            next_offset = writer.next_offset,
            "Batch appended"
        );
        Ok(stats)
    }

    /// Flush the active segment to disk.
    pub fn sync(&self) -> Result<()> {
        let writer = self.writer.lock();
        match &writer.active {
            Some(active) => active.file.flush_all(),
            None => Ok(()),
        }
    }

    fn write_records(&self, writer: &mut Writer, records: &[Record], stats: &mut AppendStats) -> Result<()> {
        let capacity = self.config.segment_capacity();
        let mut scratch = Vec::new();

        for record in records {
            ensure!(
                record.offset == writer.next_offset,
                OffsetGapSnafu {
                    expected: writer.next_offset,
                    actual:   record.offset,
                }
            );
            let size = record.disk_size() as u64;
            ensure!(size <= capacity, RecordTooLargeSnafu { size, capacity });

            let must_roll = writer.active.as_ref().is_none_or(|active| {
                self.config.roll_strategy.should_roll(
                    active.info.size_bytes - SEGMENT_HEADER_SIZE as u64,
                    capacity,
                    active.info.record_count,
                    size,
                )
            });
            if must_roll {
                self.roll(writer, stats)?;
            }

            let Some(active) = writer.active.as_mut() else {
                unreachable!("roll always leaves an active segment");
            };
            scratch.clear();
            record.encode_into(&mut scratch)?;
            active.file.write_at(active.info.size_bytes, &scratch)?;
            active.info.size_bytes += size;
            active.info.record_count += 1;
            writer.next_offset += 1;
            stats.appended += 1;
            stats.bytes += size;
        }
        Ok(())
    }

    /// Flush written bytes and publish them to readers.
    fn commit(&self, writer: &Writer) -> Result<()> {
        let Some(active) = writer.active.as_ref() else {
            return Ok(());
        };
        let mut meta = self.meta.write();
        let published = meta
            .segments
            .back()
            .filter(|segment| segment.base_offset == active.info.base_offset)
            .map_or(SEGMENT_HEADER_SIZE as u64, |segment| segment.size_bytes);
        active.file.flush(
            self.config.flush_mode,
            published,
            active.info.size_bytes.saturating_sub(published),
        )?;

        if let Some(back) = meta.segments.back_mut()
            && back.base_offset == active.info.base_offset
        {
            *back = active.info.clone();
        }
        meta.next_offset = writer.next_offset;
        Ok(())
    }

    /// Seal the active segment (if any) and start a new one at the next offset.
    fn roll(&self, writer: &mut Writer, stats: &mut AppendStats) -> Result<()> {
        if writer.active.is_some() {
            self.commit(writer)?;
        }
        if let Some(mut previous) = writer.active.take() {
            previous.info.sealed = true;
            if let Err(err) = seal_segment(&previous.file, &previous.info) {
                writer.active = Some(previous);
                return Err(err);
            }
            if let Some(back) = self.meta.write().segments.back_mut() {
                back.sealed = true;
            }
            info!(
                topic = %self.name,
                base_offset = previous.info.base_offset,
                records = previous.info.record_count,
                "Segment sealed"
            );
            stats.sealed.push(previous.info.base_offset);
        }

        let base_offset = writer.next_offset;
        let path = segment_file_path(&self.dir, base_offset);
        let file = create_segment(&path, base_offset, self.config.segment_size)?;
        let info = empty_info(&path, base_offset);
        self.meta.write().segments.push_back(info.clone());
        writer.active = Some(ActiveSegment { file, info });
        info!(topic = %self.name, base_offset, path = ?path, "Segment created");

        stats.evicted.extend(self.enforce_retention());
        Ok(())
    }

    fn rollback(&self, writer: &mut Writer) {
        let meta = self.meta.read();
        writer.next_offset = meta.next_offset;
        if let Some(active) = writer.active.as_mut()
            && let Some(back) = meta.segments.back()
            && back.base_offset == active.info.base_offset
        {
            active.info = back.clone();
        }
    }

    /// Drop the oldest sealed segments until the limit holds.
    fn enforce_retention(&self) -> Vec<u64> {
        let mut evicted = Vec::new();
        let mut meta = self.meta.write();
        while meta.segments.len() > self.config.segment_limit {
            let Some(oldest) = meta.segments.front() else {
                break;
            };
            if !oldest.sealed {
                break;
            }
            match std::fs::remove_file(&oldest.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    error!(topic = %self.name, path = ?oldest.path, error = %err, "Failed to evict segment");
                    break;
                }
            }
            info!(topic = %self.name, base_offset = oldest.base_offset, "Segment evicted");
            evicted.push(oldest.base_offset);
            meta.segments.pop_front();
        }
        evicted
    }
}

impl Drop for TopicLog {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            warn!(topic = %self.name, error = %err, "Failed to flush active segment on close");
        }
    }
}

fn empty_info(path: &Path, base_offset: u64) -> SegmentInfo {
    SegmentInfo {
        path: path.to_path_buf(),
        base_offset,
        size_bytes: SEGMENT_HEADER_SIZE as u64,
        record_count: 0,
        sealed: false,
    }
}

fn log_recovery(topic: &str, report: &RecoveryReport) {
    if report.truncated_bytes > 0 || !report.quarantined.is_empty() {
        warn!(
            topic,
            segments = report.segments,
            truncated_bytes = report.truncated_bytes,
            quarantined = report.quarantined.len(),
            next_offset = report.next_offset,
            "Topic log recovered with repairs"
        );
    } else {
        info!(
            topic,
            segments = report.segments,
            next_offset = report.next_offset,
            "Topic log opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::RollStrategy;

    fn records(range: std::ops::Range<u64>, body_len: usize) -> Vec<Record> {
        range
            .map(|offset| Record {
                offset,
                timestamp: 0,
                run_type: 1,
                id: String::new(),
                body: Bytes::from(vec![b'a'; body_len]),
            })
            .collect()
    }

    fn small_config(segment_limit: usize) -> LogConfig {
        LogConfig {
            segment_size: 1024,
            segment_limit,
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_first_append_creates_segment() {
        let temp_dir = TempDir::new().unwrap();
        let log = TopicLog::open(temp_dir.path(), "t", small_config(10)).unwrap();
        assert!(log.segments().is_empty());
        assert_eq!(log.locate(0), Located::Pending);

        log.append_batch(&records(0..3, 10)).unwrap();
        let segments = log.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].record_count, 3);
        assert_eq!(log.next_offset(), 3);
        assert!(matches!(log.locate(2), Located::Segment(_)));
    }

    #[test]
    fn test_offset_gap_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let log = TopicLog::open(temp_dir.path(), "t", small_config(10)).unwrap();
        let err = log.append_batch(&records(1..2, 10)).unwrap_err();
        assert!(matches!(err, crate::LogError::OffsetGap { expected: 0, actual: 1, .. }));
        assert_eq!(log.next_offset(), 0);
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let log = TopicLog::open(temp_dir.path(), "t", small_config(10)).unwrap();
        let err = log.append_batch(&records(0..1, 2048)).unwrap_err();
        assert!(matches!(err, crate::LogError::RecordTooLarge { .. }));
    }

    #[test]
    fn test_roll_seals_previous_segment() {
        let temp_dir = TempDir::new().unwrap();
        let log = TopicLog::open(temp_dir.path(), "t", small_config(10)).unwrap();

        // 100-byte bodies take 131 bytes on disk; 7 fit in 960 bytes.
        let stats = log.append_batch(&records(0..8, 100)).unwrap();
        assert_eq!(stats.sealed, vec![0]);

        let segments = log.segments();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].sealed);
        assert_eq!(segments[0].record_count, 7);
        assert!(!segments[1].sealed);
        assert_eq!(segments[1].base_offset, 7);
    }

    #[test]
    fn test_count_strategy_rolls_by_records() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            roll_strategy: RollStrategy::ByCount(2),
            ..small_config(10)
        };
        let log = TopicLog::open(temp_dir.path(), "t", config).unwrap();
        log.append_batch(&records(0..5, 1)).unwrap();

        let bases: Vec<u64> = log.segments().iter().map(|s| s.base_offset).collect();
        assert_eq!(bases, vec![0, 2, 4]);
    }

    #[test]
    fn test_retention_never_exceeds_limit() {
        let temp_dir = TempDir::new().unwrap();
        let log = TopicLog::open(temp_dir.path(), "t", small_config(2)).unwrap();
        for start in (0..40).step_by(4) {
            log.append_batch(&records(start..start + 4, 100)).unwrap();
            assert!(log.segments().len() <= 2);
        }
        assert!(log.earliest_offset() > 0);
        assert!(matches!(log.locate(0), Located::Skipped { resume_at } if resume_at == log.earliest_offset()));
    }
}
