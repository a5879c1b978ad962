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

//! Memory-mapped region files using mmap-io.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use mmap_io::MemoryMappedFile;
use snafu::{ResultExt, ensure};

use crate::{
    Result,
    error::{DeviceSnafu, IoSnafu, ReadOnlySnafu},
};

/// One memory-mapped region of a queue.
///
/// Wraps mmap-io's MemoryMappedFile with bounds-checked offset reads and
/// writes. Read-only mappings reject writes.
pub(crate) struct MappedRegion {
    mmap:     MemoryMappedFile,
    path:     PathBuf,
    len:      usize,
    writable: bool,
}

impl MappedRegion {
    /// Create the region file with `len` bytes, replacing any existing file.
    pub(crate) fn create(path: &Path, len: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }

        let mmap = MemoryMappedFile::create_rw(path, len as u64).map_err(|e| {
            DeviceSnafu {
                path:    path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })?;

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            len,
            writable: true,
        })
    }

    /// Map an existing region file.
    pub(crate) fn open(path: &Path, writable: bool) -> Result<Self> {
        let mapped = if writable {
            MemoryMappedFile::open_rw(path)
        } else {
            MemoryMappedFile::open_ro(path)
        };
        let mmap = mapped.map_err(|e| {
            DeviceSnafu {
                path:    path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })?;
        let len = usize::try_from(mmap.len()).unwrap_or(usize::MAX);

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            len,
            writable,
        })
    }

    /// Map read-write when permitted, read-only otherwise.
    pub(crate) fn open_preferring_rw(path: &Path) -> Result<Self> {
        Self::open(path, true).or_else(|_| Self::open(path, false))
    }

    #[inline]
    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            DeviceSnafu {
                path:    self.path.display().to_string(),
                message: format!(
                    "access of {len} bytes at offset {offset} exceeds region of {} bytes",
                    self.len
                ),
            }
        );
        Ok(())
    }

    #[inline]
    pub(crate) fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.mmap.read_into(offset as u64, buf).map_err(|e| {
            DeviceSnafu {
                path:    self.path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })
    }

    #[inline]
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        ensure!(
            self.writable,
            ReadOnlySnafu {
                path: self.path.display().to_string(),
            }
        );
        self.check_bounds(offset, data.len())?;
        self.mmap.update_region(offset as u64, data).map_err(|e| {
            DeviceSnafu {
                path:    self.path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })
    }

    /// Resize the backing file and remap it.
    pub(crate) fn truncate_or_extend(&mut self, len: usize) -> Result<()> {
        ensure!(
            self.writable,
            ReadOnlySnafu {
                path: self.path.display().to_string(),
            }
        );
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .context(IoSnafu { path: &self.path })?;
        file.set_len(len as u64)
            .context(IoSnafu { path: &self.path })?;
        drop(file);

        self.mmap = MemoryMappedFile::open_rw(&self.path).map_err(|e| {
            DeviceSnafu {
                path:    self.path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })?;
        self.len = len;
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.mmap.flush().map_err(|e| {
            DeviceSnafu {
                path:    self.path.display().to_string(),
                message: e.to_string(),
            }
            .build()
        })
    }

    pub(crate) const fn len(&self) -> usize { self.len }

    pub(crate) const fn is_writable(&self) -> bool { self.writable }

    pub(crate) fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_region() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("q.stat");

        let region = MappedRegion::create(&path, 4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert!(region.is_writable());
        assert!(path.exists());
    }

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q.buf");

        {
            let region = MappedRegion::create(&path, 256).unwrap();
            region.write_at(100, b"Test data at offset").unwrap();
            region.flush().unwrap();
        }

        let region = MappedRegion::open(&path, false).unwrap();
        let mut buf = [0u8; 19];
        region.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"Test data at offset");
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q.buf");
        MappedRegion::create(&path, 64).unwrap();

        let region = MappedRegion::open(&path, false).unwrap();
        let err = region.write_at(0, b"x").unwrap_err();
        assert!(err.is_device());
    }

    #[test]
    fn test_out_of_bounds_access() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q.buf");
        let region = MappedRegion::create(&path, 64).unwrap();

        let mut buf = [0u8; 8];
        assert!(region.read_at(60, &mut buf).is_err());
        assert!(region.write_at(usize::MAX, b"x").is_err());
    }

    #[test]
    fn test_truncate_or_extend() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q.buf");
        let mut region = MappedRegion::create(&path, 64).unwrap();
        region.write_at(0, b"keep").unwrap();

        region.truncate_or_extend(128).unwrap();
        assert_eq!(region.len(), 128);
        region.write_at(120, b"tail").unwrap();

        let mut head = [0u8; 4];
        region.read_at(0, &mut head).unwrap();
        assert_eq!(&head, b"keep");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 128);
    }
}
