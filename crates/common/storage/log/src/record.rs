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

#![allow(clippy::cast_possible_truncation)]

//! Record type and on-disk record format.
//!
//! Records are stored back to back after the segment header:
//!
//! ```text
//! ┌────────────┬────────────┬───────────────┬─────────────┬────────────┬──────┬──────────────┬──────┬───────────┐
//! │ length u32 │ offset u64 │ timestamp i64 │ run_type u8 │ id_len u16 │ id   │ body_len u32 │ body │ crc32 u32 │
//! └────────────┴────────────┴───────────────┴─────────────┴────────────┴──────┴──────────────┴──────┴───────────┘
//! ```
//!
//! All integers are little-endian. `length` counts every byte after itself,
//! checksum included. The checksum covers `length` and the frame up to the
//! checksum. A zero `length` marks the end of written data, which is what a
//! freshly preallocated segment contains.

use bytes::{BufMut, Bytes};
use snafu::ensure;

use crate::{
    Result,
    crc::{record_crc, verify_record_crc},
    error::{CorruptedRecordSnafu, InvalidRecordSnafu},
};

/// Size of the length prefix in bytes.
pub const RECORD_LENGTH_SIZE: usize = 4;

/// Size of the trailing CRC32 in bytes.
pub const RECORD_CRC_SIZE: usize = 4;

/// Fixed-width fields between the length prefix and the id bytes, plus the
/// body length field.
pub const RECORD_FIXED_SIZE: usize = 8 + 8 + 1 + 2 + 4;

/// A single log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic-scoped position, assigned before append.
    pub offset:    u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub run_type:  u8,
    /// Message identifier carried for downstream deduplication.
    pub id:        String,
    pub body:      Bytes,
}

/// Total on-disk size of a record with the given id and body lengths.
#[inline]
#[must_use]
pub const fn record_disk_size(id_len: usize, body_len: usize) -> usize {
    RECORD_LENGTH_SIZE + RECORD_FIXED_SIZE + id_len + body_len + RECORD_CRC_SIZE
}

impl Record {
    #[must_use]
    pub const fn disk_size(&self) -> usize { record_disk_size(self.id.len(), self.body.len()) }

    /// Appends the encoded record to `buf`.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        ensure!(
            u16::try_from(self.id.len()).is_ok(),
            InvalidRecordSnafu {
                offset: self.offset,
                reason: format!("id of {} bytes is too long", self.id.len()),
            }
        );
        ensure!(
            u32::try_from(self.disk_size()).is_ok(),
            InvalidRecordSnafu {
                offset: self.offset,
                reason: format!("body of {} bytes is too long", self.body.len()),
            }
        );

        let length = (self.disk_size() - RECORD_LENGTH_SIZE) as u32;
        let start = buf.len();
        buf.reserve(self.disk_size());
        buf.put_u32_le(length);
        buf.put_u64_le(self.offset);
        buf.put_i64_le(self.timestamp);
        buf.put_u8(self.run_type);
        buf.put_u16_le(self.id.len() as u16);
        buf.put_slice(self.id.as_bytes());
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
        let crc = record_crc(length, &buf[start + RECORD_LENGTH_SIZE..]);
        buf.put_u32_le(crc);
        Ok(())
    }

    /// Decodes a record from the bytes that follow its length prefix.
    ///
    /// `frame` must be exactly `length` bytes long. `position` is only used to
    /// describe failures.
    pub(crate) fn decode(length: u32, frame: &[u8], position: u64) -> Result<Self> {
        let corrupted = |reason: String| {
            CorruptedRecordSnafu {
                offset: position,
                reason,
            }
            .build()
        };

        if frame.len() != length as usize || frame.len() < RECORD_FIXED_SIZE + RECORD_CRC_SIZE {
            return Err(corrupted(format!("bad frame length {length}")));
        }

        let (payload, crc_bytes) = frame.split_at(frame.len() - RECORD_CRC_SIZE);
        let stored_crc = u32::from_le_bytes(read_array(crc_bytes, 0));
        if !verify_record_crc(length, payload, stored_crc) {
            return Err(corrupted("checksum mismatch".to_string()));
        }

        let offset = u64::from_le_bytes(read_array(payload, 0));
        let timestamp = i64::from_le_bytes(read_array(payload, 8));
        let run_type = payload[16];
        let id_len = u16::from_le_bytes(read_array(payload, 17)) as usize;

        let id_end = 19 + id_len;
        if id_end + 4 > payload.len() {
            return Err(corrupted(format!("id length {id_len} overruns frame")));
        }
        let id = String::from_utf8_lossy(&payload[19..id_end]).into_owned();

        let body_len = u32::from_le_bytes(read_array(payload, id_end)) as usize;
        let body_start = id_end + 4;
        if body_start + body_len != payload.len() {
            return Err(corrupted(format!("body length {body_len} disagrees with frame")));
        }

        Ok(Self {
            offset,
            timestamp,
            run_type,
            id,
            body: Bytes::copy_from_slice(&payload[body_start..]),
        })
    }
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: u64, body: &'static [u8]) -> Record {
        Record {
            offset,
            timestamp: 1_700_000_000_000,
            run_type: 1,
            id: "id-1".to_string(),
            body: Bytes::from_static(body),
        }
    }

    fn encode(record: &Record) -> Vec<u8> {
        let mut buf = Vec::new();
        record.encode_into(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_disk_size_matches_encoding() {
        let record = sample(3, b"hello");
        let buf = encode(&record);
        assert_eq!(buf.len(), record.disk_size());
        assert_eq!(record_disk_size(0, 0), 31);
    }

    #[test]
    fn test_decode_encoded_record() {
        let record = sample(42, b"login event");
        let buf = encode(&record);
        let length = u32::from_le_bytes(buf[..4].try_into().unwrap());

        let decoded = Record::decode(length, &buf[4..], 0).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_flipped_body_byte_is_detected() {
        let record = sample(7, b"payload");
        let mut buf = encode(&record);
        let length = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let last_body_byte = buf.len() - RECORD_CRC_SIZE - 1;
        buf[last_body_byte] ^= 0xFF;

        let err = Record::decode(length, &buf[4..], 0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let err = Record::decode(3, &[0, 0, 0], 0).unwrap_err();
        assert!(err.is_corruption());
    }
}
