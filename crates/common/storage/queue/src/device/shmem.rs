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

//! Shared-memory backend.
//!
//! Segments are memory-mapped files under `/dev/shm` (tmpfs) named after the
//! numeric key, so every process resolving the same key attaches to the same
//! pages. Hosts without `/dev/shm` fall back to the system temp directory.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::ResultExt;

use super::{Access, DeviceKind, Region, StorageDevice, pair::RegionPair};
use crate::{Result, error::IoSnafu};

const SHMEM_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SHMEM_ROOT: &str = "/dev/shm";

/// Queue stored in a pair of shared-memory segments identified by a key.
pub struct ShmemDevice {
    path:    String,
    key:     i32,
    regions: RegionPair,
}

impl ShmemDevice {
    fn segment_dir() -> PathBuf {
        let root = Path::new(SHMEM_ROOT);
        if root.is_dir() {
            root.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    #[must_use]
    pub fn status_segment(key: i32) -> PathBuf {
        Self::segment_dir().join(format!("fmq_shmem_{key}.stat"))
    }

    #[must_use]
    pub fn buffer_segment(key: i32) -> PathBuf {
        Self::segment_dir().join(format!("fmq_shmem_{key}.buf"))
    }

    pub fn open(path: &str, key: i32, access: Access) -> Result<Self> {
        let regions =
            RegionPair::open(&Self::status_segment(key), &Self::buffer_segment(key), access)?;
        Ok(Self {
            path: path.to_string(),
            key,
            regions,
        })
    }

    #[must_use]
    pub fn exists(key: i32) -> bool {
        Self::status_segment(key).is_file() && Self::buffer_segment(key).is_file()
    }

    /// Removes both segments of `key`; missing segments are not an error.
    pub fn remove(key: i32) -> Result<()> {
        for segment in [Self::status_segment(key), Self::buffer_segment(key)] {
            match std::fs::remove_file(&segment) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(e).context(IoSnafu { path: segment });
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn key(&self) -> i32 { self.key }
}

impl StorageDevice for ShmemDevice {
    fn kind(&self) -> DeviceKind { DeviceKind::Shmem { key: self.key } }

    fn path(&self) -> &str { &self.path }

    fn is_writable(&self) -> bool { self.regions.is_writable() }

    fn region_len(&self, region: Region) -> usize { self.regions.region_len(region) }

    fn read(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.regions.read(region, offset, buf)
    }

    fn write(&self, region: Region, offset: usize, data: &[u8]) -> Result<()> {
        self.regions.write(region, offset, data)
    }

    fn truncate_or_extend(&mut self, region: Region, len: usize) -> Result<()> {
        self.regions.truncate_or_extend(region, len)
    }

    fn lock(&mut self, timeout: Option<Duration>) -> Result<()> { self.regions.lock(timeout) }

    fn unlock(&mut self) -> Result<()> { self.regions.unlock() }

    fn flush(&self) -> Result<()> { self.regions.flush() }

    fn default_poll_interval(&self) -> Duration { SHMEM_POLL_INTERVAL }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Geometry, open_device};

    /// Key unlikely to collide with other test processes.
    fn test_key(salt: i32) -> i32 {
        i32::try_from(std::process::id() % 100_000).unwrap() * 100 + salt
    }

    #[test]
    fn test_shmem_selected_by_path() {
        let key = test_key(1);
        let path = format!("/tmp/fmq_test_shmem_{key}");
        let geometry = Geometry {
            nslots:   2,
            buf_size: 128,
        };

        {
            let writer = open_device(&path, Access::Create(geometry)).unwrap();
            assert_eq!(writer.kind(), DeviceKind::Shmem { key });
            writer.write(Region::Buffer, 0, b"shared").unwrap();
        }
        assert!(ShmemDevice::exists(key));

        let reader = open_device(&path, Access::ReadOnly).unwrap();
        assert_eq!(reader.read_vec(Region::Buffer, 0, 6).unwrap(), b"shared");
        assert_eq!(reader.default_poll_interval(), SHMEM_POLL_INTERVAL);
        drop(reader);

        ShmemDevice::remove(key).unwrap();
        assert!(!ShmemDevice::exists(key));
    }
}
