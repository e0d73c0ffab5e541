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

//! Startup recovery of a topic directory.
//!
//! Sealed segments are trusted as described by their header. Unsealed
//! segments are scanned record by record; the first record that fails its
//! checksum or breaks offset continuity ends the valid data, and everything
//! after it is zeroed. Segments with an unreadable header are renamed aside.
//! None of these repairs fail the open.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::{info, warn};

use crate::{
    LogError, Result,
    error::{IoSnafu, SegmentHeaderSnafu},
    file::{DataFile, ReadOnlyDataFile},
    path::{quarantine, scan_segment_files},
    segment::{SEGMENT_HEADER_SIZE, SegmentHeader, SegmentInfo, read_header, scan_segment, seal_segment},
};

/// Summary of what recovery found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments:        usize,
    pub truncated_bytes: u64,
    pub quarantined:     Vec<PathBuf>,
    pub next_offset:     u64,
}

pub(crate) struct Recovered {
    pub segments:    VecDeque<SegmentInfo>,
    pub next_offset: u64,
    /// Writable mapping of the last segment when it is still open.
    pub active:      Option<DataFile>,
    pub report:      RecoveryReport,
}

pub(crate) fn recover(dir: &Path) -> Result<Recovered> {
    let files = scan_segment_files(dir)?;
    let last_idx = files.len().saturating_sub(1);

    let mut report = RecoveryReport::default();
    let mut segments: VecDeque<SegmentInfo> = VecDeque::new();
    let mut active = None;

    for (idx, (base_offset, path)) in files.into_iter().enumerate() {
        let header = match inspect(&path, base_offset) {
            Ok(header) => header,
            Err(err) => {
                warn!(path = ?path, error = %err, "Unreadable segment, moving it aside");
                report.quarantined.push(quarantine(&path)?);
                continue;
            }
        };

        if let Some(previous) = segments.back()
            && base_offset < previous.end_offset()
        {
            warn!(
                path = ?path,
                base_offset,
                previous_end = previous.end_offset(),
                "Segment overlaps its predecessor, moving it aside"
            );
            report.quarantined.push(quarantine(&path)?);
            continue;
        }

        let is_last = idx == last_idx;
        let info = if header.sealed {
            SegmentInfo {
                path: path.clone(),
                base_offset,
                size_bytes: header.sealed_size,
                record_count: header.record_count,
                sealed: true,
            }
        } else {
            let file = DataFile::open(&path)?;
            let outcome = scan_segment(&file, base_offset);
            if outcome.torn {
                let cut = file.size() - outcome.end;
                warn!(
                    path = ?path,
                    valid_records = outcome.record_count,
                    valid_end = outcome.end,
                    "Truncating damaged tail"
                );
                file.zero_from(outcome.end)?;
                report.truncated_bytes += cut;
            }
            let mut info = SegmentInfo {
                path: path.clone(),
                base_offset,
                size_bytes: outcome.end,
                record_count: outcome.record_count,
                sealed: false,
            };
            if is_last {
                active = Some(file);
            } else {
                info.sealed = true;
                seal_segment(&file, &info)?;
                info!(path = ?path, records = info.record_count, "Sealed interrupted segment");
            }
            info
        };

        if info.sealed && info.record_count == 0 {
            // Nothing to read, and its name would clash with the next segment.
            remove_empty(&info.path)?;
            continue;
        }

        if let Some(previous) = segments.back()
            && info.base_offset > previous.end_offset()
        {
            warn!(
                from = previous.end_offset(),
                to = info.base_offset,
                "Offsets missing between segments"
            );
        }
        segments.push_back(info);
    }

    let next_offset = segments.back().map_or(0, SegmentInfo::end_offset);
    if active.is_some() && segments.back().is_some_and(|segment| segment.sealed) {
        active = None;
    }
    report.segments = segments.len();
    report.next_offset = next_offset;

    Ok(Recovered {
        segments,
        next_offset,
        active,
        report,
    })
}

/// Read and sanity-check a segment header.
fn inspect(path: &Path, base_offset: u64) -> Result<SegmentHeader, LogError> {
    let file = ReadOnlyDataFile::open(path)?;
    let mut header = read_header(&file, path)?;
    if header.base_offset != base_offset {
        return SegmentHeaderSnafu {
            path:   path.to_path_buf(),
            reason: format!(
                "header base offset {} disagrees with file name {base_offset}",
                header.base_offset
            ),
        }
        .fail();
    }
    let size_plausible =
        header.sealed_size >= SEGMENT_HEADER_SIZE as u64 && header.sealed_size <= file.size();
    if header.sealed && !size_plausible {
        warn!(path = ?path, sealed_size = header.sealed_size, "Implausible sealed size, rescanning");
        header = SegmentHeader::unsealed(base_offset);
    }
    Ok(header)
}

fn remove_empty(path: &Path) -> Result<()> {
    std::fs::remove_file(path).context(IoSnafu { path })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::{LogConfig, path::segment_file_path, record::Record, segment::create_segment};

    struct TestFixture {
        temp_dir: TempDir,
        config:   LogConfig,
    }

    impl TestFixture {
        fn new() -> Self {
            Self {
                temp_dir: TempDir::new().unwrap(),
                config:   LogConfig {
                    segment_size: 4096,
                    ..LogConfig::default()
                },
            }
        }

        fn dir(&self) -> &Path { self.temp_dir.path() }

        /// Write `count` records starting at `base` into a fresh segment and
        /// return the end position.
        fn write_segment(&self, base: u64, count: u64, sealed: bool) -> u64 {
            let path = segment_file_path(self.dir(), base);
            let file = create_segment(&path, base, self.config.segment_size).unwrap();
            let mut buf = Vec::new();
            for offset in base..base + count {
                Record {
                    offset,
                    timestamp: 0,
                    run_type: 1,
                    id: format!("m{offset}"),
                    body: Bytes::from_static(b"recovery"),
                }
                .encode_into(&mut buf)
                .unwrap();
            }
            file.write_at(SEGMENT_HEADER_SIZE as u64, &buf).unwrap();
            let end = SEGMENT_HEADER_SIZE as u64 + buf.len() as u64;
            if sealed {
                let info = SegmentInfo {
                    path,
                    base_offset: base,
                    size_bytes: end,
                    record_count: count,
                    sealed: true,
                };
                seal_segment(&file, &info).unwrap();
            }
            end
        }
    }

    #[test]
    fn test_empty_directory() {
        let fixture = TestFixture::new();
        let recovered = recover(fixture.dir()).unwrap();
        assert!(recovered.segments.is_empty());
        assert_eq!(recovered.next_offset, 0);
        assert!(recovered.active.is_none());
    }

    #[test]
    fn test_sealed_then_active() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 5, true);
        fixture.write_segment(5, 3, false);

        let recovered = recover(fixture.dir()).unwrap();
        assert_eq!(recovered.segments.len(), 2);
        assert_eq!(recovered.next_offset, 8);
        assert!(recovered.active.is_some());
        assert_eq!(recovered.report.truncated_bytes, 0);
    }

    #[test]
    fn test_sealed_last_segment_leaves_no_active() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 4, true);

        let recovered = recover(fixture.dir()).unwrap();
        assert_eq!(recovered.next_offset, 4);
        assert!(recovered.active.is_none());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let fixture = TestFixture::new();
        let end = fixture.write_segment(0, 3, false);

        let path = segment_file_path(fixture.dir(), 0);
        let file = DataFile::open(&path).unwrap();
        file.write_at(end, &[0x30, 0, 0, 0, 9, 9, 9]).unwrap();
        drop(file);

        let recovered = recover(fixture.dir()).unwrap();
        assert_eq!(recovered.next_offset, 3);
        assert!(recovered.report.truncated_bytes > 0);
        assert_eq!(recovered.segments[0].size_bytes, end);

        // The damaged bytes are gone, so a second recovery is clean.
        drop(recovered);
        let again = recover(fixture.dir()).unwrap();
        assert_eq!(again.report.truncated_bytes, 0);
        assert_eq!(again.next_offset, 3);
    }

    #[test]
    fn test_unreadable_header_is_quarantined() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 2, true);
        std::fs::write(segment_file_path(fixture.dir(), 2), vec![0xAB; 128]).unwrap();

        let recovered = recover(fixture.dir()).unwrap();
        assert_eq!(recovered.segments.len(), 1);
        assert_eq!(recovered.next_offset, 2);
        assert_eq!(recovered.report.quarantined.len(), 1);
        assert!(!segment_file_path(fixture.dir(), 2).exists());
    }

    #[test]
    fn test_unsealed_middle_segment_gets_sealed() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 2, false);
        fixture.write_segment(2, 2, false);

        let recovered = recover(fixture.dir()).unwrap();
        assert!(recovered.segments[0].sealed);
        assert!(!recovered.segments[1].sealed);
        assert_eq!(recovered.next_offset, 4);
    }
}
