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

//! Crash-safe small state files using a dual-slot strategy.
//!
//! A state file `name` is kept as `name.1`, `name.2` and `name.current`.
//! Each write goes to the slot that is not current, is synced, and only then
//! is `name.current` replaced (written to `name.current.tmp`, synced and
//! renamed over). At any crash point at least one slot holds a complete
//! payload.
//!
//! Every slot carries a write sequence. When the pointer is missing, torn or
//! names a damaged slot, the intact slot with the highest sequence wins.
//!
//! ## Slot Format
//!
//! ```text
//! ┌─────────────────┬───────────────────────────┐
//! │ magic: [u8; 4]  │ "ZQST"                    │
//! │ version: u32    │ Format version, 1         │
//! │ sequence: u64   │ Write sequence            │
//! │ length: u32     │ Payload length            │
//! │ checksum: u32   │ CRC32 of sequence, length │
//! │                 │ and payload               │
//! │ payload         │ `length` bytes            │
//! └─────────────────┴───────────────────────────┘
//! ```

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    LogError, Result,
    crc::slot_crc,
    error::{IoSnafu, SlotCorruptedSnafu},
};

const SLOT_MAGIC: [u8; 4] = *b"ZQST";
const SLOT_VERSION: u32 = 1;
const SLOT_HEADER_SIZE: usize = 24;
const SLOTS: [u8; 2] = [1, 2];

/// A small state blob persisted atomically.
pub struct SlotFile {
    dir:          PathBuf,
    name:         String,
    current_slot: u8,
    /// Sequence of the latest write seen or made.
    sequence:     u64,
}

/// One intact slot.
struct Slot {
    number:   u8,
    sequence: u64,
    payload:  Vec<u8>,
}

impl SlotFile {
    /// Open (or prepare) the state file `name` inside `dir`.
    ///
    /// A damaged pointer or slot is tolerated as long as one slot is intact.
    pub fn open<P: AsRef<Path>>(dir: P, name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        let mut file = Self {
            dir,
            name: name.into(),
            current_slot: 0,
            sequence: 0,
        };
        let (intact, _) = file.scan_slots()?;
        file.sequence = intact.iter().map(|slot| slot.sequence).max().unwrap_or(0);
        // The next write must not land on the slot `read` would return.
        file.current_slot = match file.latest() {
            Ok(slot) => slot.map_or(0, |slot| slot.number),
            Err(err) if err.is_corruption() => 0,
            Err(err) => return Err(err),
        };
        Ok(file)
    }

    /// Replace the stored payload.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let next_slot = if self.current_slot == 1 { 2 } else { 1 };
        let sequence = self.sequence + 1;
        let slot_path = self.slot_path(next_slot);

        let mut data = Vec::with_capacity(SLOT_HEADER_SIZE + payload.len());
        data.extend_from_slice(&SLOT_MAGIC);
        data.extend_from_slice(&SLOT_VERSION.to_le_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&slot_crc(sequence, payload.len() as u32, payload).to_le_bytes());
        data.extend_from_slice(payload);

        write_synced(&slot_path, &data)?;
        self.replace_pointer(next_slot)?;
        self.current_slot = next_slot;
        self.sequence = sequence;

        debug!(slot = next_slot, sequence, path = ?slot_path, "State file written");
        Ok(())
    }

    /// Read the latest intact payload.
    ///
    /// The slot named by the pointer is preferred; otherwise the intact slot
    /// with the highest sequence is used. Fails only when slots exist but
    /// none of them is intact.
    pub fn read(&self) -> Result<Option<Vec<u8>>> { Ok(self.latest()?.map(|slot| slot.payload)) }

    /// Remove every file backing this state.
    pub fn remove(self) -> Result<()> {
        for path in [
            self.slot_path(1),
            self.slot_path(2),
            self.pointer_path(),
            self.pointer_temp_path(),
        ] {
            if path.exists() {
                fs::remove_file(&path).context(IoSnafu { path: &path })?;
            }
        }
        Ok(())
    }

    fn latest(&self) -> Result<Option<Slot>> {
        let pointer = self.read_pointer()?;
        let (mut intact, damaged) = self.scan_slots()?;

        if let Some(pointed) = pointer {
            if let Some(at) = intact.iter().position(|slot| slot.number == pointed) {
                return Ok(Some(intact.swap_remove(at)));
            }
            warn!(name = %self.name, slot = pointed, "Current state slot unreadable, trying the other slot");
        }

        match intact.into_iter().max_by_key(|slot| slot.sequence) {
            Some(slot) => Ok(Some(slot)),
            None => damaged.map_or(Ok(None), Err),
        }
    }

    /// Intact slots, plus the first corruption seen.
    fn scan_slots(&self) -> Result<(Vec<Slot>, Option<LogError>)> {
        let mut intact = Vec::with_capacity(SLOTS.len());
        let mut damaged = None;
        for number in SLOTS {
            match self.read_slot(number) {
                Ok(Some(slot)) => intact.push(slot),
                Ok(None) => {}
                Err(err) if err.is_corruption() => {
                    warn!(name = %self.name, slot = number, error = %err, "Damaged state slot ignored");
                    damaged.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok((intact, damaged))
    }

    /// Slot named by the pointer file. A torn or invalid pointer reads as
    /// absent.
    fn read_pointer(&self) -> Result<Option<u8>> {
        let path = self.pointer_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(IoSnafu { path }),
        };
        match bytes.as_slice() {
            [slot] if SLOTS.contains(slot) => Ok(Some(*slot)),
            _ => {
                warn!(name = %self.name, pointer = ?bytes, "Invalid state pointer ignored");
                Ok(None)
            }
        }
    }

    fn replace_pointer(&self, slot: u8) -> Result<()> {
        let temp = self.pointer_temp_path();
        let path = self.pointer_path();
        write_synced(&temp, &[slot])?;
        fs::rename(&temp, &path).context(IoSnafu { path: &path })?;
        sync_dir(&self.dir)
    }

    fn read_slot(&self, number: u8) -> Result<Option<Slot>> {
        let path = self.slot_path(number);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(IoSnafu { path }),
        };

        ensure!(
            data.len() >= SLOT_HEADER_SIZE && data[0..4] == SLOT_MAGIC,
            SlotCorruptedSnafu {
                path:   path.clone(),
                reason: "missing header".to_string(),
            }
        );
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let version = word(4);
        ensure!(
            version == SLOT_VERSION,
            SlotCorruptedSnafu {
                path:   path.clone(),
                reason: format!("unsupported version {version}"),
            }
        );
        let mut raw_sequence = [0u8; 8];
        raw_sequence.copy_from_slice(&data[8..16]);
        let sequence = u64::from_le_bytes(raw_sequence);
        let length = word(16);
        ensure!(
            data.len() == SLOT_HEADER_SIZE + length as usize,
            SlotCorruptedSnafu {
                path:   path.clone(),
                reason: format!("expected {length} payload bytes"),
            }
        );
        let payload = &data[SLOT_HEADER_SIZE..];
        ensure!(
            slot_crc(sequence, length, payload) == word(20),
            SlotCorruptedSnafu {
                path,
                reason: "checksum mismatch".to_string(),
            }
        );
        Ok(Some(Slot {
            number,
            sequence,
            payload: payload.to_vec(),
        }))
    }

    fn slot_path(&self, slot: u8) -> PathBuf { self.dir.join(format!("{}.{slot}", self.name)) }

    fn pointer_path(&self) -> PathBuf { self.dir.join(format!("{}.current", self.name)) }

    fn pointer_temp_path(&self) -> PathBuf { self.dir.join(format!("{}.current.tmp", self.name)) }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file: File = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .context(IoSnafu { path })?;
    file.write_all(data).context(IoSnafu { path })?;
    file.sync_all().context(IoSnafu { path })
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .context(IoSnafu { path: dir })
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> { Ok(()) }
