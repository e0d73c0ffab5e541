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

use crate::{record::record_disk_size, segment::SEGMENT_HEADER_SIZE};

/// Settings shared by every topic log opened with them.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Preallocated size of each segment file, header included.
    pub segment_size:  u64,
    /// Maximum number of segments (active included) kept per topic.
    pub segment_limit: usize,
    pub roll_strategy: RollStrategy,
    pub flush_mode:    FlushMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size:  10 * 1024 * 1024,
            segment_limit: 3000,
            roll_strategy: RollStrategy::BySize,
            flush_mode:    FlushMode::Async,
        }
    }
}

impl LogConfig {
    /// Bytes available for records in one segment.
    #[must_use]
    pub const fn segment_capacity(&self) -> u64 {
        self.segment_size.saturating_sub(SEGMENT_HEADER_SIZE as u64)
    }

    /// Smallest segment size that can hold at least one empty record.
    #[must_use]
    pub const fn min_segment_size() -> u64 { (SEGMENT_HEADER_SIZE + record_disk_size(0, 0)) as u64 }
}

/// When the active segment is sealed in favour of a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollStrategy {
    /// Roll when the next record would not fit in the segment.
    BySize,
    /// Roll when the segment already holds this many records, or when the
    /// next record would not fit.
    ByCount(u64),
    /// Roll when any of the strategies says so.
    Combined(Vec<Self>),
}

impl RollStrategy {
    /// Decide whether a record of `next_len` bytes must go to a new segment.
    #[must_use]
    pub fn should_roll(&self, used: u64, capacity: u64, count: u64, next_len: u64) -> bool {
        let over_size = used + next_len > capacity;
        match self {
            Self::BySize => over_size,
            Self::ByCount(max_count) => over_size || (count > 0 && count >= *max_count),
            Self::Combined(strategies) => strategies
                .iter()
                .any(|s| s.should_roll(used, capacity, count, next_len)),
        }
    }
}

/// Durability of each batch append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Leave write-back to the page cache. Survives process crashes, not
    /// power loss.
    #[default]
    Async,
    /// msync the written range before the append returns.
    Sync,
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(RollStrategy::BySize, 900, 0, 100, false ; "exact fit stays")]
    #[test_case(RollStrategy::BySize, 901, 0, 100, true ; "overflow rolls")]
    #[test_case(RollStrategy::ByCount(10), 0, 9, 10, false ; "below count cap")]
    #[test_case(RollStrategy::ByCount(10), 0, 10, 10, true ; "count cap reached")]
    #[test_case(RollStrategy::ByCount(10), 995, 1, 10, true ; "count strategy still honours size")]
    fn test_should_roll(strategy: RollStrategy, used: u64, count: u64, next: u64, expected: bool) {
        assert_eq!(strategy.should_roll(used, 1000, count, next), expected);
    }

    #[test]
    fn test_combined_rolls_when_any_member_does() {
        let strategy = RollStrategy::Combined(vec![RollStrategy::BySize, RollStrategy::ByCount(5)]);
        assert!(!strategy.should_roll(10, 1000, 4, 10));
        assert!(strategy.should_roll(10, 1000, 5, 10));
        assert!(strategy.should_roll(995, 1000, 0, 10));
    }

    #[test]
    fn test_capacity_excludes_header() {
        let config = LogConfig {
            segment_size: 1024,
            ..LogConfig::default()
        };
        assert_eq!(config.segment_capacity(), 1024 - SEGMENT_HEADER_SIZE as u64);
        assert!(LogConfig::min_segment_size() > SEGMENT_HEADER_SIZE as u64);
    }
}
