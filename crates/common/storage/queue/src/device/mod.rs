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

//! Byte-addressable, lockable storage behind a queue.
//!
//! A queue lives in two regions: the status region (header and slot table)
//! and the buffer region (message entries). Two backends implement
//! [`StorageDevice`]: [`FileDevice`] for regular files and [`ShmemDevice`]
//! for shared-memory segments. [`open_device`] picks one from the queue path.

mod file;
mod lock;
mod pair;
mod region;
mod shmem;

use std::{path::Path, time::Duration};

pub use file::FileDevice;
pub use shmem::ShmemDevice;

use crate::Result;

/// The two regions every device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Status header followed by the slot table.
    Status,
    /// Circular message buffer.
    Buffer,
}

/// Backend selected for a queue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    File,
    Shmem { key: i32 },
}

impl DeviceKind {
    /// Resolves the backend for `path` by the shared-memory naming rule.
    #[must_use]
    pub fn for_path(path: &str) -> Self {
        shmem_key(path).map_or(Self::File, |key| Self::Shmem { key })
    }
}

/// Sizes of the two regions of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nslots:   usize,
    pub buf_size: usize,
}

impl Geometry {
    #[must_use]
    pub const fn status_len(&self) -> usize { crate::layout::status_region_len(self.nslots) }
}

/// How a device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Create fresh regions with the given sizes, replacing existing ones.
    Create(Geometry),
    /// Attach to existing regions for reading and writing.
    ReadWrite,
    /// Attach to existing regions, buffer mapped read-only.
    ReadOnly,
}

/// Uniform storage interface consumed by the queue.
///
/// Offsets are relative to the start of the addressed region.
pub trait StorageDevice: Send {
    fn kind(&self) -> DeviceKind;

    /// The queue path this device was opened for.
    fn path(&self) -> &str;

    fn is_writable(&self) -> bool;

    fn region_len(&self, region: Region) -> usize;

    fn read(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<()>;

    fn write(&self, region: Region, offset: usize, data: &[u8]) -> Result<()>;

    /// Resizes a region. Contents beyond the new length are lost.
    fn truncate_or_extend(&mut self, region: Region, len: usize) -> Result<()>;

    /// Takes the exclusive writer lock, waiting at most `timeout` when set.
    fn lock(&mut self, timeout: Option<Duration>) -> Result<()>;

    fn unlock(&mut self) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Poll interval for blocking operations when none is configured.
    fn default_poll_interval(&self) -> Duration;

    /// Reads `len` bytes at `offset` into a new buffer.
    fn read_vec(&self, region: Region, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(region, offset, &mut buf)?;
        Ok(buf)
    }
}

/// Opens the device for `path`, choosing the backend by its name.
pub fn open_device(path: &str, access: Access) -> Result<Box<dyn StorageDevice>> {
    Ok(match DeviceKind::for_path(path) {
        DeviceKind::File => Box::new(FileDevice::open(path, access)?),
        DeviceKind::Shmem { key } => Box::new(ShmemDevice::open(path, key, access)?),
    })
}

/// Whether both regions of the queue at `path` exist.
#[must_use]
pub fn device_exists(path: &str) -> bool {
    match DeviceKind::for_path(path) {
        DeviceKind::File => FileDevice::exists(path),
        DeviceKind::Shmem { key } => ShmemDevice::exists(key),
    }
}

/// Deletes the backing storage of the queue at `path`.
pub fn remove_queue(path: &str) -> Result<()> {
    match DeviceKind::for_path(path) {
        DeviceKind::File => FileDevice::remove(path),
        DeviceKind::Shmem { key } => ShmemDevice::remove(key),
    }
}

/// Extracts the shared-memory key from a queue path.
///
/// The final path component must contain `shmem`; its last `_`-separated
/// token must start with an integer, which becomes the key.
#[must_use]
pub fn shmem_key(path: &str) -> Option<i32> {
    let name = Path::new(path).file_name()?.to_str()?;
    if !name.contains("shmem") {
        return None;
    }
    leading_int(name.rsplit('_').next()?)
}

fn leading_int(token: &str) -> Option<i32> {
    let token = token.trim_start();
    let (sign, digits) = match token.as_bytes().first()? {
        b'-' => (-1, &token[1..]),
        b'+' => (1, &token[1..]),
        _ => (1, token),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i32>().ok().map(|value| sign * value)
}
