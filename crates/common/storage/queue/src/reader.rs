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

//! The read path.
//!
//! Every handle keeps a [`ReadCursor`]: the id and slot of the last message
//! it returned. The next message is the one in the following slot carrying
//! the following id. When that slot holds anything else the writer has
//! lapped the reader, which then resumes at the oldest live message and
//! logs how many were skipped.
//!
//! Readers never take the writer lock to read. Slots and entries are
//! validated after loading and re-checked when validation fails, so a
//! record caught mid-update is retried rather than reported as corrupt.

use std::{
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::{
    FmqError, Result,
    compression::{self, Envelope},
    entry,
    error::{CorruptionSnafu, IdNotFoundSnafu, TimeoutSnafu},
    layout::{MAX_ID, Slot, StatusHeader, id_distance, next_id, prev_id},
    message::Message,
    queue::Queue,
    table::{self, READ_ATTEMPTS},
};

/// Where a handle's next read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Before the oldest live message.
    Start,
    /// After the youngest message; only later writes are read.
    End,
    /// Before the youngest message, so it is read next.
    Last,
    /// One message back from the current position.
    Back,
}

/// Id and slot of the last message read. `None` means nothing has been
/// read since the last seek to the start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    pub last_id:   Option<i32>,
    pub last_slot: Option<usize>,
}

impl Queue {
    /// Moves the read position.
    pub fn seek(&mut self, position: SeekPosition) -> Result<()> {
        match position {
            SeekPosition::Start => self.cursor = ReadCursor::default(),
            SeekPosition::End => {
                let header = table::read_header(self.device.as_ref())?;
                self.cursor = if header.is_empty() {
                    ReadCursor::default()
                } else {
                    ReadCursor {
                        last_id:   Some(header.youngest_id),
                        last_slot: header.youngest_slot(),
                    }
                };
            }
            SeekPosition::Last => {
                let header = table::read_header(self.device.as_ref())?;
                self.cursor = match header.youngest_slot().filter(|_| !header.is_empty()) {
                    Some(youngest) => ReadCursor {
                        last_id:   Some(prev_id(header.youngest_id)),
                        last_slot: Some(header.prev_slot(youngest)),
                    },
                    None => ReadCursor::default(),
                };
            }
            SeekPosition::Back => {
                if let (Some(id), Some(slot)) = (self.cursor.last_id, self.cursor.last_slot) {
                    let nslots = self.geometry.nslots.max(1);
                    self.cursor = ReadCursor {
                        last_id:   Some(prev_id(id)),
                        last_slot: Some((slot + nslots - 1) % nslots),
                    };
                }
            }
        }
        trace!(?position, cursor = ?self.cursor, "Seek");
        self.publish_read_position();
        Ok(())
    }

    /// Positions the handle so the message after `id` is read next.
    ///
    /// An id older than every live message seeks to the start.
    ///
    /// # Errors
    ///
    /// `IdNotFound` when `id` was never written or the queue is empty.
    pub fn seek_to_id(&mut self, id: i32) -> Result<()> {
        let header = table::read_header(self.device.as_ref())?;
        let not_found = || {
            IdNotFoundSnafu {
                path: self.config.path.clone(),
                id,
            }
            .build()
        };
        let Some(oldest_slot) = header.oldest_slot().filter(|_| !header.is_empty()) else {
            return Err(not_found());
        };

        let slots = table::read_slots(self.device.as_ref(), header.nslots())?;
        if let Some(slot_num) = slots.iter().position(|s| s.active && s.id == id) {
            self.cursor = ReadCursor {
                last_id:   Some(id),
                last_slot: Some(slot_num),
            };
            self.publish_read_position();
            return Ok(());
        }

        let oldest_id = slots[oldest_slot].id;
        if id_distance(id, oldest_id) < MAX_ID / 2 {
            debug!(id, oldest_id, "Requested id already evicted, seeking to start");
            return self.seek(SeekPosition::Start);
        }
        Err(not_found())
    }

    /// Reads the next message, optionally restricted to `msg_type`.
    ///
    /// Messages of other types are consumed and skipped. With `wait` set the
    /// call polls for up to that long, calling the heartbeat every cycle,
    /// before giving up; `Ok(None)` means no matching message arrived.
    pub fn read_msg(
        &mut self,
        msg_type: Option<i32>,
        wait: Option<Duration>,
    ) -> Result<Option<Message>> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            if let Some(msg) = self.read_matching(msg_type)? {
                return Ok(Some(msg));
            }
            // A caught-up reader still owes a blocking writer its position.
            self.republish_if_stale();
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.beat("waiting for message");
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Waits for the next message, optionally restricted to `msg_type`.
    ///
    /// Polls until a message arrives, calling the heartbeat every cycle.
    ///
    /// # Errors
    ///
    /// `Timeout` once the handle's blocking read timeout elapses.
    pub fn read_msg_blocking(&mut self, msg_type: Option<i32>) -> Result<Message> {
        let started = Instant::now();
        loop {
            if let Some(msg) = self.read_matching(msg_type)? {
                return Ok(msg);
            }
            self.republish_if_stale();

            let mut nap = self.poll_interval;
            if let Some(limit) = self.blocking_read_timeout {
                let waited = started.elapsed();
                ensure!(
                    waited < limit,
                    TimeoutSnafu {
                        path: self.config.path.clone(),
                        waited,
                    }
                );
                nap = nap.min(limit - waited);
            }
            self.beat("waiting for message");
            thread::sleep(nap);
        }
    }

    /// Iterates over the messages currently available without waiting.
    pub fn messages(&mut self) -> Messages<'_> { Messages { queue: self } }

    fn read_matching(&mut self, msg_type: Option<i32>) -> Result<Option<Message>> {
        while let Some(msg) = self.read_next()? {
            if msg_type.is_none_or(|wanted| wanted == msg.msg_type) {
                return Ok(Some(msg));
            }
            trace!(id = msg.id, msg_type = msg.msg_type, "Skipping message of other type");
        }
        Ok(None)
    }

    fn read_next(&mut self) -> Result<Option<Message>> {
        let mut torn = None;
        for _ in 0..READ_ATTEMPTS {
            let header = table::read_header(self.device.as_ref())?;
            if header.is_empty() || self.cursor.last_id == Some(header.youngest_id) {
                return Ok(None);
            }
            let Some((slot_num, slot)) = self.next_slot(&header)? else {
                return Ok(None);
            };

            match self.load(slot_num, &slot) {
                Ok(msg) if self.slot_unchanged(slot_num, &slot) => {
                    self.cursor = ReadCursor {
                        last_id:   Some(slot.id),
                        last_slot: Some(slot_num),
                    };
                    if header.blocking_write {
                        self.publish_read_position();
                    }
                    return Ok(Some(msg));
                }
                Ok(_) => debug!(slot = slot_num, "Slot reused while reading, retrying"),
                Err(e) if e.is_corruption() => {
                    if self.slot_unchanged(slot_num, &slot) {
                        return Err(e);
                    }
                    debug!(slot = slot_num, "Entry replaced while reading, retrying");
                    torn = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        torn.map_or(Ok(None), Err)
    }

    /// The slot following the cursor, or the oldest live slot when the
    /// writer has lapped the reader.
    fn next_slot(&self, header: &StatusHeader) -> Result<Option<(usize, Slot)>> {
        let Some(oldest_slot) = header.oldest_slot() else {
            return Ok(None);
        };
        let candidate = self
            .cursor
            .last_slot
            .filter(|&slot| slot < header.nslots())
            .map_or(oldest_slot, |slot| header.next_slot(slot));
        let expected = self.cursor.last_id.map(next_id);

        let slot = table::read_slot(self.device.as_ref(), candidate)?;
        if slot.active && expected.is_none_or(|id| id == slot.id) {
            return Ok(Some((candidate, slot)));
        }

        let oldest = table::read_slot(self.device.as_ref(), oldest_slot)?;
        if !oldest.active {
            return Ok(None);
        }
        if let Some(expected) = expected {
            warn!(
                path = %self.config.path,
                expected,
                resumed_at = oldest.id,
                skipped = id_distance(expected, oldest.id),
                "Reader overrun by writer, resuming at oldest message"
            );
        }
        Ok(Some((oldest_slot, oldest)))
    }

    fn slot_unchanged(&self, slot_num: usize, slot: &Slot) -> bool {
        table::read_slot(self.device.as_ref(), slot_num).is_ok_and(|now| now == *slot)
    }

    fn load(&self, slot_num: usize, slot: &Slot) -> Result<Message> {
        let body = entry::read_body(self.device.as_ref(), slot_num, slot)?;
        let msg_len = slot.msg_len();

        let (payload, compressed) = if !slot.compress {
            ensure!(
                msg_len <= body.len(),
                CorruptionSnafu {
                    path:   self.device.path(),
                    what:   format!("slot {slot_num}"),
                    reason: format!("message of {msg_len} bytes in a {} byte entry", body.len()),
                }
            );
            (body.slice(..msg_len), false)
        } else {
            let corrupt = |reason: String| {
                CorruptionSnafu {
                    path: self.device.path(),
                    what: format!("slot {slot_num}"),
                    reason,
                }
                .build()
            };
            let envelope = Envelope::parse(&body).map_err(|e| corrupt(e.to_string()))?;
            if envelope.uncompressed_len != msg_len {
                return Err(corrupt(format!(
                    "envelope announces {} bytes, slot records {msg_len}",
                    envelope.uncompressed_len
                )));
            }
            if self.config.passthrough_compressed {
                (body.slice(..envelope.total_len()), true)
            } else {
                let data = compression::decompress(&body).map_err(|e| corrupt(e.to_string()))?;
                (Bytes::from(data), false)
            }
        };

        Ok(Message {
            id: slot.id,
            slot: slot_num,
            msg_type: slot.msg_type,
            subtype: slot.subtype,
            time: slot.time(),
            payload,
            compressed,
            uncompressed_len: msg_len,
        })
    }

    /// Stores the cursor id in the header for a writer that blocks on
    /// unread messages.
    fn publish_read_position(&mut self) {
        let Some(id) = self.cursor.last_id else {
            return;
        };
        if table::read_header(self.device.as_ref()).is_ok_and(|header| !header.blocking_write) {
            return;
        }
        let result = self.with_lock(|q| {
            let mut header = table::read_header(q.device.as_ref())?;
            if header.blocking_write && header.last_id_read != id {
                header.last_id_read = id;
                table::write_header(q.device.as_ref(), &header)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(e @ FmqError::ReadOnly { .. }) => {
                debug!(error = %e, "Read position not published");
            }
            Err(e) => warn!(error = %e, "Unable to publish read position"),
        }
    }

    fn republish_if_stale(&mut self) {
        let Some(id) = self.cursor.last_id else {
            return;
        };
        if let Ok(header) = table::read_header(self.device.as_ref())
            && header.blocking_write
            && header.last_id_read != id
        {
            self.publish_read_position();
        }
    }
}

/// Non-blocking iterator over a handle's unread messages.
pub struct Messages<'a> {
    queue: &'a mut Queue,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> { self.queue.read_msg(None, None).transpose() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueConfig;

    fn open(dir: &tempfile::TempDir, nslots: usize, buf_size: usize) -> Queue {
        Queue::open(
            QueueConfig {
                num_slots: nslots,
                buf_size,
                ..QueueConfig::new(dir.path().join("queue").display().to_string())
            },
            None,
        )
        .unwrap()
    }

    fn ids(queue: &mut Queue) -> Vec<i32> { queue.messages().map(|m| m.unwrap().id).collect() }

    #[test]
    fn test_reads_in_write_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = open(&temp_dir, 8, 4096);
        for n in 0..5u8 {
            queue.write(i32::from(n), 0, &[n; 10]).unwrap();
        }
        queue.seek(SeekPosition::Start).unwrap();

        let msg = queue.read_msg(None, None).unwrap().unwrap();
        assert_eq!((msg.id, msg.msg_type, msg.payload.as_ref()), (0, 0, &[0u8; 10][..]));
        assert_eq!(ids(&mut queue), vec![1, 2, 3, 4]);
        assert!(queue.read_msg(None, None).unwrap().is_none());
        assert_eq!(queue.last_slot_read(), Some(4));
    }

    #[test]
    fn test_lapped_reader_resumes_at_oldest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = open(&temp_dir, 4, 4096);
        queue.write(1, 0, b"first").unwrap();
        queue.seek(SeekPosition::Start).unwrap();
        assert_eq!(queue.read_msg(None, None).unwrap().unwrap().id, 0);

        for _ in 0..6 {
            queue.write(1, 0, b"more").unwrap();
        }
        assert_eq!(ids(&mut queue), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_seek_back_and_last() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = open(&temp_dir, 8, 4096);
        for _ in 0..3 {
            queue.write(1, 0, b"m").unwrap();
        }

        queue.seek(SeekPosition::Last).unwrap();
        assert_eq!(queue.read_msg(None, None).unwrap().unwrap().id, 2);
        queue.seek(SeekPosition::Back).unwrap();
        assert_eq!(queue.read_msg(None, None).unwrap().unwrap().id, 2);

        queue.seek(SeekPosition::Start).unwrap();
        queue.seek(SeekPosition::Back).unwrap();
        assert_eq!(queue.cursor(), ReadCursor::default());
    }

    #[test]
    fn test_seek_to_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = open(&temp_dir, 4, 4096);
        for _ in 0..6 {
            queue.write(1, 0, b"m").unwrap();
        }

        queue.seek_to_id(3).unwrap();
        assert_eq!(queue.read_msg(None, None).unwrap().unwrap().id, 4);

        queue.seek_to_id(0).unwrap();
        assert_eq!(queue.read_msg(None, None).unwrap().unwrap().id, 2);

        assert!(matches!(
            queue.seek_to_id(40).unwrap_err(),
            FmqError::IdNotFound { id: 40, .. }
        ));
    }

    #[test]
    fn test_torn_entry_is_corruption() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = open(&temp_dir, 4, 4096);
        queue.write(1, 0, b"payload").unwrap();
        queue
            .device
            .write(crate::device::Region::Buffer, 0, &[0u8; 4])
            .unwrap();

        queue.seek(SeekPosition::Start).unwrap();
        assert!(queue.read_msg(None, None).unwrap_err().is_corruption());
    }

    #[test]
    fn test_envelope_length_disagreeing_with_slot_is_corruption() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::open(
            QueueConfig {
                compress: true,
                num_slots: 4,
                buf_size: 4096,
                ..QueueConfig::new(temp_dir.path().join("queue").display().to_string())
            },
            None,
        )
        .unwrap();
        queue.write(1, 0, &[7u8; 400]).unwrap();
        // Uncompressed length word of the envelope, after the entry's
        // cookie and slot number.
        queue
            .device
            .write(crate::device::Region::Buffer, 12, &[0x7f, 0xff, 0xff, 0xff])
            .unwrap();

        queue.seek(SeekPosition::Start).unwrap();
        let err = queue.read_msg(None, None).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }
}
