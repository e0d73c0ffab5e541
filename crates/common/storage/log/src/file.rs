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

//! Memory-mapped segment files using mmap-io.

use std::path::{Path, PathBuf};

use mmap_io::MemoryMappedFile;
use snafu::ResultExt;

use crate::{
    FlushMode, Result,
    error::{IoSnafu, MmapFailedSnafu},
};

const ZERO_CHUNK: usize = 64 * 1024;

/// Writable memory-mapped file, preallocated to its full size.
pub struct DataFile {
    mmap: MemoryMappedFile,
    path: PathBuf,
    size: u64,
}

impl DataFile {
    /// Create a new file of `size` bytes, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }

        let mmap = MemoryMappedFile::create_rw(&path, size).map_err(|e| {
            MmapFailedSnafu {
                path:    path.clone(),
                message: e.to_string(),
            }
            .build()
        })?;

        Ok(Self { mmap, path, size })
    }

    /// Open an existing file for writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mmap = MemoryMappedFile::open_rw(&path).map_err(|e| {
            MmapFailedSnafu {
                path:    path.clone(),
                message: e.to_string(),
            }
            .build()
        })?;
        let size = mmap.len();

        Ok(Self { mmap, path, size })
    }

    #[inline]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.mmap
            .update_region(offset, data)
            .map_err(|e| self.mmap_error(&e))
    }

    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap.read_into(offset, buf).map_err(|e| self.mmap_error(&e))
    }

    /// Overwrite `[from, size)` with zeroes.
    ///
    /// Used to cut off a damaged tail so later reads stop at `from`.
    pub fn zero_from(&self, from: u64) -> Result<()> {
        let zeroes = vec![0u8; ZERO_CHUNK];
        let mut position = from;
        while position < self.size {
            let len = usize::try_from(self.size - position).map_or(ZERO_CHUNK, |n| n.min(ZERO_CHUNK));
            self.write_at(position, &zeroes[..len])?;
            position += len as u64;
        }
        self.flush_range(from, self.size - from.min(self.size))
    }

    pub const fn size(&self) -> u64 { self.size }

    pub fn path(&self) -> &Path { &self.path }

    /// Flush written data according to `mode`.
    ///
    /// `Async` leaves write-back to the page cache; `Sync` forces the given
    /// range to disk before returning.
    pub fn flush(&self, mode: FlushMode, offset: u64, len: u64) -> Result<()> {
        match mode {
            FlushMode::Async => Ok(()),
            FlushMode::Sync => self.flush_range(offset, len),
        }
    }

    /// Flush the whole mapping.
    pub fn flush_all(&self) -> Result<()> { self.mmap.flush().map_err(|e| self.mmap_error(&e)) }

    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.mmap
            .flush_range(offset, len)
            .map_err(|e| self.mmap_error(&e))
    }

    fn mmap_error(&self, e: &dyn std::fmt::Display) -> crate::LogError {
        MmapFailedSnafu {
            path:    self.path.clone(),
            message: e.to_string(),
        }
        .build()
    }
}

/// Read-only memory-mapped file.
pub struct ReadOnlyDataFile {
    mmap: MemoryMappedFile,
    path: PathBuf,
    size: u64,
}

impl ReadOnlyDataFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = MemoryMappedFile::open_ro(&path).map_err(|e| {
            MmapFailedSnafu {
                path:    path.clone(),
                message: e.to_string(),
            }
            .build()
        })?;
        let size = mmap.len();

        Ok(Self { mmap, path, size })
    }

    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap.read_into(offset, buf).map_err(|e| {
            MmapFailedSnafu {
                path:    self.path.clone(),
                message: e.to_string(),
            }
            .build()
        })
    }

    pub const fn size(&self) -> u64 { self.size }

    pub fn path(&self) -> &Path { &self.path }
}
