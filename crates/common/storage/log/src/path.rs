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

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{Result, error::IoSnafu};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Suffix appended to segments whose header cannot be read.
pub const QUARANTINE_EXTENSION: &str = "corrupt";

/// Segment file name: `<base offset, 20 digits>.seg`.
#[must_use]
pub fn segment_file_name(base_offset: u64) -> String {
    format!("{base_offset:020}.{SEGMENT_EXTENSION}")
}

#[must_use]
pub fn segment_file_path<P: AsRef<Path>>(dir: P, base_offset: u64) -> PathBuf {
    dir.as_ref().join(segment_file_name(base_offset))
}

/// Parse the base offset encoded in a segment file name.
#[must_use]
pub fn parse_base_offset(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Segment files directly under `dir`, ordered by base offset.
pub fn scan_segment_files<P: AsRef<Path>>(dir: P) -> Result<Vec<(u64, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let path = entry.context(IoSnafu { path: dir })?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(base_offset) = parse_base_offset(&path) {
            files.push((base_offset, path));
        }
    }
    files.sort_by_key(|(base_offset, _)| *base_offset);
    Ok(files)
}

/// Move an unreadable segment out of the way so it is never scanned again.
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut target = path.as_os_str().to_os_string();
    target.push(".");
    target.push(QUARANTINE_EXTENSION);
    let target = PathBuf::from(target);
    std::fs::rename(path, &target).context(IoSnafu { path })?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_segment_file_name_is_sortable() {
        assert_eq!(segment_file_name(0), "00000000000000000000.seg");
        assert_eq!(segment_file_name(1234), "00000000000000001234.seg");
        assert!(segment_file_name(9) < segment_file_name(10));
    }

    #[test_case("00000000000000001234.seg", Some(1234) ; "segment file")]
    #[test_case("00000000000000001234.seg.corrupt", None ; "quarantined file")]
    #[test_case("1234.seg", None ; "unpadded name")]
    #[test_case("0000000000000000abcd.seg", None ; "not a number")]
    #[test_case("consumers", None ; "directory name")]
    fn test_parse_base_offset(name: &str, expected: Option<u64>) {
        assert_eq!(parse_base_offset(Path::new(name)), expected);
    }

    #[test]
    fn test_scan_orders_by_base_offset() {
        let temp_dir = tempfile::tempdir().unwrap();
        for base in [30u64, 0, 10] {
            std::fs::write(segment_file_path(temp_dir.path(), base), b"").unwrap();
        }
        std::fs::write(temp_dir.path().join("notes.txt"), b"").unwrap();

        let files = scan_segment_files(temp_dir.path()).unwrap();
        let bases: Vec<u64> = files.iter().map(|(b, _)| *b).collect();
        assert_eq!(bases, vec![0, 10, 30]);
    }

    #[test]
    fn test_quarantine_renames_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = segment_file_path(temp_dir.path(), 0);
        std::fs::write(&path, b"junk").unwrap();

        let target = quarantine(&path).unwrap();
        assert!(!path.exists());
        assert!(target.exists());
        assert!(scan_segment_files(temp_dir.path()).unwrap().is_empty());
    }
}
