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

//! CRC32 checksums for records, segment headers and state files.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. Record checksums cover the
//! length prefix as well as the frame so a torn length is detected too.

use crc32fast::Hasher;

/// Checksum of a record frame, including its length prefix.
#[inline]
pub(crate) fn record_crc(length: u32, frame: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(frame);
    hasher.finalize()
}

#[inline]
pub(crate) fn verify_record_crc(length: u32, frame: &[u8], expected: u32) -> bool {
    record_crc(length, frame) == expected
}

/// Checksum of a state-file slot: its sequence, length and payload.
pub(crate) fn slot_crc(sequence: u64, length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Plain checksum over a byte slice.
#[inline]
pub(crate) fn checksum(data: &[u8]) -> u32 { crc32fast::hash(data) }
