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

//! The write path.
//!
//! A write takes the device lock, frees the next slot and enough buffer
//! space by evicting the oldest messages, then stores the entry, the slot
//! record and finally the header. A reader that sees the new header
//! therefore always finds a complete slot and entry behind it.
//!
//! With blocking writes enabled the writer refuses to evict a message the
//! reader has not consumed yet; it releases the lock and polls until the
//! reader catches up or the write timeout expires.

use std::{borrow::Cow, thread, time::Instant};

use snafu::ensure;
use tracing::{debug, error, trace};

use crate::{
    Result,
    allocator::{self, Allocator, Placement},
    compression::{self, Envelope},
    device::Region,
    entry,
    error::{CompressionSnafu, FullQueueSnafu, InvalidConfigSnafu, TimeoutSnafu},
    layout::{Slot, StatusHeader, next_id, now_secs, stored_len},
    queue::{DeviceSlots, Queue},
    table,
};

/// A message ready to be placed in the buffer.
struct Outgoing<'a> {
    msg_type:   i32,
    subtype:    i32,
    body:       &'a [u8],
    msg_len:    i32,
    compressed: bool,
}

impl Queue {
    /// Writes a message and returns its id.
    ///
    /// When the handle compresses, the payload is stored compressed unless
    /// that would not make it smaller.
    ///
    /// # Errors
    ///
    /// - `ReadOnly` for handles opened without write access
    /// - `FullQueue` when the message cannot fit even an empty buffer
    /// - `Timeout` when a blocking write waits too long for the reader
    pub fn write(&mut self, msg_type: i32, subtype: i32, payload: &[u8]) -> Result<i32> {
        self.ensure_writable()?;
        let msg_len = message_len(payload.len())?;

        let mut body = Cow::Borrowed(payload);
        let mut compressed = false;
        if self.config.compress {
            let envelope = compression::compress(self.config.compression_method, payload)?;
            if envelope.len() < payload.len() {
                body = Cow::Owned(envelope);
                compressed = true;
            } else {
                trace!(len = payload.len(), "Compression does not help, storing raw");
            }
        }

        self.write_outgoing(&Outgoing {
            msg_type,
            subtype,
            body: &body,
            msg_len,
            compressed,
        })
    }

    /// Writes a payload that is already a compressed envelope, as produced
    /// by [`compress`](crate::compress).
    pub fn write_precompressed(
        &mut self,
        msg_type: i32,
        subtype: i32,
        envelope: &[u8],
        uncompressed_len: usize,
    ) -> Result<i32> {
        self.ensure_writable()?;
        let parsed = Envelope::parse(envelope)?;
        ensure!(
            parsed.uncompressed_len == uncompressed_len,
            CompressionSnafu {
                message: format!(
                    "envelope holds {} bytes, caller claims {uncompressed_len}",
                    parsed.uncompressed_len
                ),
            }
        );
        self.write_outgoing(&Outgoing {
            msg_type,
            subtype,
            body: &envelope[..parsed.total_len()],
            msg_len: message_len(uncompressed_len)?,
            compressed: true,
        })
    }

    fn write_outgoing(&mut self, outgoing: &Outgoing<'_>) -> Result<i32> {
        self.lock()?;
        let result = self.write_locked(outgoing);
        let unlocked = self.unlock();
        let id = result?;
        unlocked?;
        Ok(id)
    }

    fn write_locked(&mut self, outgoing: &Outgoing<'_>) -> Result<i32> {
        let need = stored_len(outgoing.body.len());
        let started = Instant::now();
        let mut repaired = false;

        loop {
            let (mut header, write_slot, placement, evicted) = match self.place(need) {
                Ok(placed) => placed,
                Err(e) if e.is_corruption() && !repaired => {
                    error!(path = %self.config.path, error = %e, "Queue corrupt at write time");
                    self.repair(e)?;
                    repaired = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let offset = match placement {
                Placement::At(offset) => offset,
                Placement::Blocked { id } => {
                    header.time_written = now_secs();
                    table::write_header(self.device.as_ref(), &header)?;
                    self.wait_for_reader(id, started)?;
                    continue;
                }
            };

            let id = next_id(header.youngest_id);
            let device = self.device.as_ref();
            let framed = entry::encode(i32::try_from(write_slot).unwrap_or(0), id, outgoing.body);
            device.write(Region::Buffer, usize::try_from(offset).unwrap_or(0), &framed)?;

            let time = now_secs();
            let slot = Slot {
                active: true,
                id,
                time,
                msg_len: outgoing.msg_len,
                stored_len: i32::try_from(need).unwrap_or(i32::MAX),
                offset,
                msg_type: outgoing.msg_type,
                subtype: outgoing.subtype,
                compress: outgoing.compressed,
                checksum: 0,
            };
            table::write_slot(device, write_slot, &slot)?;

            allocator::commit(&mut header, write_slot, id, offset, need);
            header.time_written = time;
            table::write_header(device, &header)?;

            self.last_slot_written = Some(write_slot);
            debug!(
                id,
                slot = write_slot,
                offset,
                stored_len = need,
                evicted,
                compressed = outgoing.compressed,
                "Wrote message"
            );
            return Ok(id);
        }
    }

    /// Frees the next slot and `need` bytes, returning the updated header,
    /// the slot to write, where to write and how many messages were evicted.
    fn place(&self, need: usize) -> Result<(StatusHeader, usize, Placement, usize)> {
        let mut header = table::read_header(self.device.as_ref())?;
        ensure!(
            need <= header.buf_size(),
            FullQueueSnafu {
                stored_len: need,
                buf_size:   header.buf_size(),
            }
        );

        let write_slot = header.youngest_slot().map_or(0, |s| header.next_slot(s));
        let reader_last_id = if self.config.blocking_write {
            header.blocking_write = true;
            Some(header.last_id_read)
        } else {
            None
        };

        let mut store = DeviceSlots(self.device.as_ref());
        let mut allocator = Allocator::new(&mut header, &mut store, reader_last_id);
        let placement = match allocator.free_slot_for_write(write_slot)? {
            Some(id) => Placement::Blocked { id },
            None => allocator.reserve(need)?,
        };
        let evicted = allocator.evicted();
        Ok((header, write_slot, placement, evicted))
    }

    /// Releases the lock for one poll interval so the reader can advance.
    fn wait_for_reader(&mut self, unread_id: i32, started: Instant) -> Result<()> {
        self.unlock()?;
        if let Some(limit) = self.config.blocking_write_timeout {
            let waited = started.elapsed();
            ensure!(
                waited < limit,
                TimeoutSnafu {
                    path: self.config.path.clone(),
                    waited,
                }
            );
        }
        trace!(id = unread_id, "Reader has not consumed oldest message yet");
        self.beat("waiting for reader");
        thread::sleep(self.poll_interval);
        self.lock()
    }
}

fn message_len(len: usize) -> Result<i32> {
    i32::try_from(len).ok().ok_or_else(|| {
        InvalidConfigSnafu {
            reason: format!("message of {len} bytes exceeds the format limit"),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        QueueConfig,
        config::OpenMode,
        layout::{ENTRY_OVERHEAD, MAX_ID},
    };

    fn config(dir: &tempfile::TempDir, nslots: usize, buf_size: usize) -> QueueConfig {
        QueueConfig {
            num_slots: nslots,
            buf_size,
            ..QueueConfig::new(dir.path().join("queue").display().to_string())
        }
    }

    #[test]
    fn test_ids_follow_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(config(&temp_dir, 8, 4096), None).unwrap();
        for expected in 0..20 {
            assert_eq!(queue.write(1, 0, b"tick").unwrap(), expected);
        }
        assert_eq!(queue.last_slot_written(), Some(19 % 8));
        assert_eq!(queue.status().unwrap().youngest_id, 19);
        queue.check().unwrap();
    }

    #[test]
    fn test_oversized_message_evicts_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(config(&temp_dir, 4, 128), None).unwrap();
        queue.write(1, 0, &[1; 40]).unwrap();

        let err = queue.write(1, 0, &[2; 128 - ENTRY_OVERHEAD + 1]).unwrap_err();
        assert!(matches!(err, crate::FmqError::FullQueue { .. }));
        let usage = queue.usage().unwrap();
        assert_eq!(usage.active_slots, 1);
        queue.check().unwrap();
    }

    #[test]
    fn test_read_only_handle_cannot_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cfg = config(&temp_dir, 4, 1024);
        drop(Queue::open(cfg.clone(), None).unwrap());

        let mut reader = Queue::open(
            QueueConfig {
                mode: OpenMode::ReadOnly,
                ..cfg
            },
            None,
        )
        .unwrap();
        let err = reader.write(1, 0, b"nope").unwrap_err();
        assert!(matches!(err, crate::FmqError::ReadOnly { .. }));
    }

    #[test]
    fn test_incompressible_payload_is_stored_raw() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(
            QueueConfig {
                compress: true,
                ..config(&temp_dir, 4, 1024)
            },
            None,
        )
        .unwrap();
        queue.write(1, 0, b"xy").unwrap();
        let slot = table::read_slot(queue.device.as_ref(), 0).unwrap();
        assert!(!slot.compress);
        assert_eq!(slot.msg_len, 2);
    }

    #[test]
    fn test_precompressed_length_must_match() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(config(&temp_dir, 4, 4096), None).unwrap();
        let data = vec![9u8; 1000];
        let envelope = compression::compress(crate::CompressionMethod::Zstd, &data).unwrap();

        assert!(queue.write_precompressed(1, 0, &envelope, 999).is_err());
        let id = queue.write_precompressed(1, 0, &envelope, 1000).unwrap();
        assert_eq!(id, 0);
        let slot = table::read_slot(queue.device.as_ref(), 0).unwrap();
        assert!(slot.compress);
        assert_eq!(slot.msg_len, 1000);
    }

    #[test]
    fn test_id_wraps_at_limit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(config(&temp_dir, 4, 1024), None).unwrap();
        queue.write(1, 0, b"a").unwrap();

        let mut header = queue.status().unwrap();
        header.youngest_id = MAX_ID - 1;
        let mut slot = table::read_slot(queue.device.as_ref(), 0).unwrap();
        slot.id = MAX_ID - 1;
        table::write_slot(queue.device.as_ref(), 0, &slot).unwrap();
        table::write_header(queue.device.as_ref(), &header).unwrap();

        assert_eq!(queue.write(1, 0, b"b").unwrap(), 0);
        assert_eq!(queue.write(1, 0, b"c").unwrap(), 1);
    }
}
