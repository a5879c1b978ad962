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

//! The queue handle and its lifecycle.
//!
//! A [`Queue`] attaches to the device behind a path according to its
//! [`OpenMode`], validates or repairs what it finds, and then serves writes
//! (see `writer`) and cursor-based reads (see `reader`) against it.
//!
//! ## Usage
//!
//! ```ignore
//! let mut queue = QueueBuilder::new("/var/fmq/radar").num_slots(500).build()?;
//! let id = queue.write(7, 0, b"volume")?;
//!
//! let mut reader = QueueBuilder::new("/var/fmq/radar")
//!     .mode(OpenMode::ReadOnly)
//!     .position(OpenPosition::Start)
//!     .build()?;
//! while let Some(msg) = reader.read_msg(None, None)? {
//!     println!("{} {:?}", msg.id, msg.payload);
//! }
//! ```

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use snafu::ensure;
use tracing::{debug, info};

use crate::{
    QueueConfig, Result,
    allocator::SlotStore,
    config::{OpenMode, OpenPosition},
    device::{Access, Geometry, Region, StorageDevice, device_exists, open_device},
    error::{CorruptionSnafu, NotFoundSnafu, ReadOnlySnafu, TimeoutSnafu},
    layout::{Slot, StatusHeader},
    reader::{ReadCursor, SeekPosition},
    recovery::{self, RecoveryReport},
    table,
};

/// Callback invoked on every poll cycle of a blocking operation, with a
/// short label naming what is being waited for.
pub type Heartbeat = Arc<dyn Fn(&str) + Send + Sync>;

/// Occupancy of the slot table and the data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub active_slots: usize,
    pub nslots:       usize,
    pub bytes_used:   usize,
    pub buf_size:     usize,
}

impl Usage {
    #[must_use]
    pub fn slot_fraction(&self) -> f64 { ratio(self.active_slots, self.nslots) }

    #[must_use]
    pub fn buffer_fraction(&self) -> f64 { ratio(self.bytes_used, self.buf_size) }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// A handle on one queue.
///
/// Each handle owns its own mapping and read cursor. Handles are `Send` but
/// not shared; open one per thread or process.
pub struct Queue {
    pub(crate) config:                QueueConfig,
    pub(crate) device:                Box<dyn StorageDevice>,
    pub(crate) heartbeat:             Option<Heartbeat>,
    pub(crate) geometry:              Geometry,
    pub(crate) cursor:                ReadCursor,
    pub(crate) poll_interval:         Duration,
    pub(crate) blocking_read_timeout: Option<Duration>,
    pub(crate) last_slot_written:     Option<usize>,
    pub(crate) recovery:              Option<RecoveryReport>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("path", &self.config.path)
            .field("mode", &self.config.mode)
            .field("geometry", &self.geometry)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Slot access for the allocator, backed by the device.
pub(crate) struct DeviceSlots<'a>(pub(crate) &'a dyn StorageDevice);

impl SlotStore for DeviceSlots<'_> {
    fn load_slot(&mut self, slot_num: usize) -> Result<Slot> { table::read_slot(self.0, slot_num) }

    fn clear_slot(&mut self, slot_num: usize) -> Result<()> {
        table::write_slot(self.0, slot_num, &Slot::default())
    }

    fn queue_path(&self) -> &str { self.0.path() }
}

impl Queue {
    /// Opens the queue described by `config`.
    pub(crate) fn open(config: QueueConfig, heartbeat: Option<Heartbeat>) -> Result<Self> {
        config.validate()?;
        let requested = Geometry {
            nslots:   config.num_slots,
            buf_size: config.buf_size,
        };
        let path = config.path.clone();

        let (device, created, waited) = match config.mode {
            OpenMode::Create => (open_device(&path, Access::Create(requested))?, true, false),
            OpenMode::ReadWrite if device_exists(&path) => {
                (open_device(&path, Access::ReadWrite)?, false, false)
            }
            OpenMode::ReadWrite => (open_device(&path, Access::Create(requested))?, true, false),
            OpenMode::ReadOnly => {
                ensure!(device_exists(&path), NotFoundSnafu { path });
                (open_device(&path, Access::ReadOnly)?, false, false)
            }
            OpenMode::BlockingReadOnly | OpenMode::BlockingReadWrite => {
                let (device, waited) = wait_for_queue(&config, heartbeat.as_ref())?;
                (device, false, waited)
            }
        };

        let poll_interval = config
            .poll_interval
            .unwrap_or_else(|| device.default_poll_interval());
        let blocking_read_timeout = config.blocking_read_timeout;
        let mut queue = Self {
            config,
            device,
            heartbeat,
            geometry: requested,
            cursor: ReadCursor::default(),
            poll_interval,
            blocking_read_timeout,
            last_slot_written: None,
            recovery: None,
        };

        if created {
            queue.with_lock(|q| recovery::reinitialize(q.device.as_mut(), requested))?;
        } else if queue.config.mode.is_writable() {
            queue.with_lock(Self::validate_or_repair)?;
        } else {
            queue.validate_readable()?;
        }
        queue.geometry = queue.stored_geometry()?;
        if queue.geometry != requested {
            debug!(
                path = %queue.config.path,
                nslots = queue.geometry.nslots,
                buf_size = queue.geometry.buf_size,
                "Using stored geometry of existing queue"
            );
        }

        if created || waited || queue.config.position == OpenPosition::Start {
            queue.seek(SeekPosition::Start)?;
        } else {
            queue.seek(SeekPosition::End)?;
        }

        info!(
            path = %queue.config.path,
            mode = ?queue.config.mode,
            kind = ?queue.device.kind(),
            nslots = queue.geometry.nslots,
            buf_size = queue.geometry.buf_size,
            created,
            "Queue opened"
        );
        Ok(queue)
    }

    fn stored_geometry(&self) -> Result<Geometry> {
        let header = table::read_header(self.device.as_ref())?;
        Ok(Geometry {
            nslots:   header.nslots(),
            buf_size: header.buf_size(),
        })
    }

    /// Full check of an existing queue, repaired per the recovery policy.
    fn validate_or_repair(&mut self) -> Result<()> {
        match recovery::check(self.device.as_ref()) {
            Ok(_) => Ok(()),
            Err(e) if e.is_corruption() => self.repair(e),
            Err(e) => Err(e),
        }
    }

    /// Applies the recovery policy. The writer lock must be held.
    pub(crate) fn repair(&mut self, cause: crate::FmqError) -> Result<()> {
        let geometry = Geometry {
            nslots:   self.config.num_slots,
            buf_size: self.config.buf_size,
        };
        let report = recovery::repair(
            self.device.as_mut(),
            self.config.recovery_policy,
            geometry,
            cause,
        )?;
        self.geometry = self.stored_geometry()?;
        self.cursor = ReadCursor::default();
        self.recovery = Some(report);
        Ok(())
    }

    /// Read-only handles never repair; they only confirm the queue is sane.
    fn validate_readable(&self) -> Result<()> {
        let header = table::read_header(self.device.as_ref())?;
        let expected = Geometry {
            nslots:   header.nslots(),
            buf_size: header.buf_size(),
        };
        let status_len = self.device.region_len(Region::Status);
        let buffer_len = self.device.region_len(Region::Buffer);
        ensure!(
            status_len == expected.status_len() && buffer_len == expected.buf_size,
            CorruptionSnafu {
                path:   self.device.path(),
                what:   "region sizes",
                reason: format!(
                    "status {status_len} and buffer {buffer_len} bytes do not match the header"
                ),
            }
        );
        Ok(())
    }

    pub(crate) fn lock(&mut self) -> Result<()> {
        if self.config.single_writer {
            return Ok(());
        }
        self.device.lock(self.config.lock_timeout)
    }

    pub(crate) fn unlock(&mut self) -> Result<()> {
        if self.config.single_writer {
            return Ok(());
        }
        self.device.unlock()
    }

    /// Runs `f` under the writer lock, releasing it on every path.
    pub(crate) fn with_lock<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.lock()?;
        let result = f(self);
        let unlocked = self.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    pub(crate) fn beat(&self, label: &str) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat(label);
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        ensure!(
            self.config.mode.is_writable() && self.device.is_writable(),
            ReadOnlySnafu {
                path: self.config.path.clone(),
            }
        );
        Ok(())
    }

    /// Runs the full consistency check without repairing anything.
    pub fn check(&self) -> Result<()> { recovery::check(self.device.as_ref()).map(|_| ()) }

    /// Checks the queue and, when it is corrupt, applies the recovery policy.
    pub fn check_and_repair(&mut self) -> Result<Option<RecoveryReport>> {
        self.ensure_writable()?;
        self.recovery = None;
        self.with_lock(Self::validate_or_repair)?;
        Ok(self.recovery.clone())
    }

    /// Discards every message and resets the queue to the configured
    /// geometry.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let geometry = Geometry {
            nslots:   self.config.num_slots,
            buf_size: self.config.buf_size,
        };
        self.with_lock(|q| recovery::reinitialize(q.device.as_mut(), geometry))?;
        self.geometry = geometry;
        self.cursor = ReadCursor::default();
        self.last_slot_written = None;
        info!(path = %self.config.path, "Queue cleared");
        Ok(())
    }

    /// The validated status header.
    pub fn status(&self) -> Result<StatusHeader> { table::read_header(self.device.as_ref()) }

    /// Live slots and bytes, summed over active slots.
    pub fn usage(&self) -> Result<Usage> {
        let slots = table::read_slots(self.device.as_ref(), self.geometry.nslots)?;
        let (active_slots, bytes_used) = slots
            .iter()
            .filter(|slot| slot.active)
            .fold((0, 0), |(n, bytes), slot| (n + 1, bytes + slot.stored_len()));
        Ok(Usage {
            active_slots,
            nslots: self.geometry.nslots,
            bytes_used,
            buf_size: self.geometry.buf_size,
        })
    }

    /// Flushes both regions to the backing storage.
    pub fn flush(&self) -> Result<()> { self.device.flush() }

    #[must_use]
    pub fn path(&self) -> &str { &self.config.path }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig { &self.config }

    #[must_use]
    pub const fn geometry(&self) -> Geometry { self.geometry }

    #[must_use]
    pub const fn cursor(&self) -> ReadCursor { self.cursor }

    #[must_use]
    pub const fn last_slot_read(&self) -> Option<usize> { self.cursor.last_slot }

    #[must_use]
    pub const fn last_slot_written(&self) -> Option<usize> { self.last_slot_written }

    /// What the last repair did, if this handle repaired the queue.
    #[must_use]
    pub const fn recovery_report(&self) -> Option<&RecoveryReport> { self.recovery.as_ref() }

    pub const fn set_blocking_read_timeout(&mut self, timeout: Option<Duration>) {
        self.blocking_read_timeout = timeout;
    }

    pub fn set_heartbeat(&mut self, heartbeat: Option<Heartbeat>) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Polls until the queue exists and carries a valid header. Returns the
/// device and whether any waiting happened.
fn wait_for_queue(
    config: &QueueConfig,
    heartbeat: Option<&Heartbeat>,
) -> Result<(Box<dyn StorageDevice>, bool)> {
    let access = if config.mode.is_writable() {
        Access::ReadWrite
    } else {
        Access::ReadOnly
    };
    let started = Instant::now();
    let mut waited = false;
    loop {
        if device_exists(&config.path) {
            match open_device(&config.path, access) {
                Ok(device) if table::read_header(device.as_ref()).is_ok() => {
                    return Ok((device, waited));
                }
                Ok(_) => debug!(path = %config.path, "Queue header not valid yet"),
                Err(e) if e.is_device() => {
                    debug!(path = %config.path, error = %e, "Queue not attachable yet");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(limit) = config.blocking_read_timeout {
            let elapsed = started.elapsed();
            ensure!(
                elapsed < limit,
                TimeoutSnafu {
                    path:   config.path.clone(),
                    waited: elapsed,
                }
            );
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat("waiting for queue to exist");
        }
        waited = true;
        thread::sleep(config.open_poll_interval);
    }
}
