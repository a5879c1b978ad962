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

use std::{path::Path, time::Duration};

use super::{Access, Region, lock::WriterLock, region::MappedRegion};
use crate::Result;

/// Status and buffer regions plus the writer lock, shared by both backends.
pub(crate) struct RegionPair {
    status: MappedRegion,
    buffer: MappedRegion,
    lock:   WriterLock,
}

impl RegionPair {
    pub(crate) fn open(status_path: &Path, buffer_path: &Path, access: Access) -> Result<Self> {
        let (status, buffer) = match access {
            Access::Create(geometry) => (
                MappedRegion::create(status_path, geometry.status_len())?,
                MappedRegion::create(buffer_path, geometry.buf_size)?,
            ),
            Access::ReadWrite => (
                MappedRegion::open(status_path, true)?,
                MappedRegion::open(buffer_path, true)?,
            ),
            // Readers still publish their position into the status region.
            Access::ReadOnly => (
                MappedRegion::open_preferring_rw(status_path)?,
                MappedRegion::open(buffer_path, false)?,
            ),
        };
        let lock = WriterLock::open(status_path)?;
        Ok(Self {
            status,
            buffer,
            lock,
        })
    }

    const fn region(&self, region: Region) -> &MappedRegion {
        match region {
            Region::Status => &self.status,
            Region::Buffer => &self.buffer,
        }
    }

    pub(crate) const fn is_writable(&self) -> bool { self.buffer.is_writable() }

    pub(crate) const fn region_len(&self, region: Region) -> usize { self.region(region).len() }

    pub(crate) fn read(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.region(region).read_at(offset, buf)
    }

    pub(crate) fn write(&self, region: Region, offset: usize, data: &[u8]) -> Result<()> {
        self.region(region).write_at(offset, data)
    }

    pub(crate) fn truncate_or_extend(&mut self, region: Region, len: usize) -> Result<()> {
        match region {
            Region::Status => self.status.truncate_or_extend(len),
            Region::Buffer => self.buffer.truncate_or_extend(len),
        }
    }

    pub(crate) fn lock(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.lock.acquire(timeout)
    }

    pub(crate) fn unlock(&mut self) -> Result<()> { self.lock.release() }

    pub(crate) fn flush(&self) -> Result<()> {
        self.status.flush()?;
        self.buffer.flush()
    }
}
