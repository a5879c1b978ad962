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

//! Regular-file backend: `<path>.stat` and `<path>.buf`.

use std::{path::PathBuf, time::Duration};

use snafu::ResultExt;

use super::{Access, DeviceKind, Region, StorageDevice, pair::RegionPair};
use crate::{Result, error::IoSnafu};

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Queue stored in two regular files next to each other.
pub struct FileDevice {
    path:    String,
    regions: RegionPair,
}

impl FileDevice {
    #[must_use]
    pub fn status_path(path: &str) -> PathBuf { PathBuf::from(format!("{path}.stat")) }

    #[must_use]
    pub fn buffer_path(path: &str) -> PathBuf { PathBuf::from(format!("{path}.buf")) }

    pub fn open(path: &str, access: Access) -> Result<Self> {
        let regions =
            RegionPair::open(&Self::status_path(path), &Self::buffer_path(path), access)?;
        Ok(Self {
            path: path.to_string(),
            regions,
        })
    }

    #[must_use]
    pub fn exists(path: &str) -> bool {
        Self::status_path(path).is_file() && Self::buffer_path(path).is_file()
    }

    /// Deletes both files; missing files are not an error.
    pub fn remove(path: &str) -> Result<()> {
        for file in [Self::status_path(path), Self::buffer_path(path)] {
            match std::fs::remove_file(&file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(e).context(IoSnafu { path: file });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl StorageDevice for FileDevice {
    fn kind(&self) -> DeviceKind { DeviceKind::File }

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

    fn default_poll_interval(&self) -> Duration { FILE_POLL_INTERVAL }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Geometry;

    #[test]
    fn test_create_then_attach() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue").display().to_string();
        let geometry = Geometry {
            nslots:   4,
            buf_size: 1024,
        };

        assert!(!FileDevice::exists(&path));
        {
            let device = FileDevice::open(&path, Access::Create(geometry)).unwrap();
            assert_eq!(device.region_len(Region::Status), geometry.status_len());
            assert_eq!(device.region_len(Region::Buffer), 1024);
            device.write(Region::Buffer, 8, b"payload").unwrap();
            device.flush().unwrap();
        }
        assert!(FileDevice::exists(&path));

        let reader = FileDevice::open(&path, Access::ReadOnly).unwrap();
        assert!(!reader.is_writable());
        assert_eq!(reader.read_vec(Region::Buffer, 8, 7).unwrap(), b"payload");
        assert_eq!(reader.kind(), DeviceKind::File);
    }

    #[test]
    fn test_open_missing_is_device_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent").display().to_string();
        let err = FileDevice::open(&path, Access::ReadWrite).err().unwrap();
        assert!(err.is_device());
    }

    #[test]
    fn test_remove() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue").display().to_string();
        let geometry = Geometry {
            nslots:   1,
            buf_size: 64,
        };
        drop(FileDevice::open(&path, Access::Create(geometry)).unwrap());

        FileDevice::remove(&path).unwrap();
        assert!(!FileDevice::exists(&path));
        FileDevice::remove(&path).unwrap();
    }
}
