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

//! Space allocation in the circular data buffer.
//!
//! The buffer has two free regions. The append region runs from
//! `begin_append` to the end of the buffer. The insert region runs from
//! `begin_insert` to `end_insert` near the start of the buffer, and grows as
//! the oldest messages are evicted. The oldest live message always starts at
//! `end_insert`.
//!
//! ```text
//! append mode:  | free (insert) | oldest ... youngest |    free (append)    |
//!               0           end_insert          begin_append          buf_size
//!
//! insert mode:  | newer ... youngest | free | oldest ... older |  unused   |
//!               0           begin_insert end_insert    begin_append   buf_size
//! ```
//!
//! Writes go to the append region until it runs out, then to the insert
//! region. When the insert region catches up with `begin_append`, every
//! message written before the wrap is gone and the queue returns to append
//! mode.

use tracing::debug;

use crate::{
    Result,
    error::{CorruptionSnafu, FullQueueSnafu},
    layout::{Slot, StatusHeader, id_distance},
};

/// Slot access needed while evicting.
pub(crate) trait SlotStore {
    fn load_slot(&mut self, slot_num: usize) -> Result<Slot>;

    fn clear_slot(&mut self, slot_num: usize) -> Result<()>;

    /// Path used in error reports.
    fn queue_path(&self) -> &str;
}

/// Outcome of an allocation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Space is available at this buffer offset.
    At(i32),
    /// Room can only be made by evicting message `id`, which the blocking
    /// reader has not read yet.
    Blocked { id: i32 },
}

/// Mutates a header in place while making room for one message.
pub(crate) struct Allocator<'a, S: SlotStore> {
    header:         &'a mut StatusHeader,
    store:          &'a mut S,
    /// Last id read by the blocking reader, when unread messages are
    /// protected from eviction.
    reader_last_id: Option<i32>,
    evicted:        usize,
}

impl<'a, S: SlotStore> Allocator<'a, S> {
    pub(crate) const fn new(
        header: &'a mut StatusHeader,
        store: &'a mut S,
        reader_last_id: Option<i32>,
    ) -> Self {
        Self {
            header,
            store,
            reader_last_id,
            evicted: 0,
        }
    }

    /// Messages evicted so far by this allocator.
    pub(crate) const fn evicted(&self) -> usize { self.evicted }

    fn is_unread(&self, id: i32) -> bool {
        let Some(last_read) = self.reader_last_id else {
            return false;
        };
        if last_read < 0 {
            return true;
        }
        // Read iff the reader's position lies between `id` and the youngest.
        id_distance(id, last_read) > id_distance(id, self.header.youngest_id)
    }

    /// Frees the slot the next write will reuse, if it is still occupied.
    pub(crate) fn free_slot_for_write(&mut self, write_slot: usize) -> Result<Option<i32>> {
        if self.header.oldest_slot() == Some(write_slot) && !self.header.is_empty() {
            return self.evict_oldest();
        }
        Ok(None)
    }

    /// Evicts the oldest message. Returns the id of a protected message
    /// instead of evicting it.
    fn evict_oldest(&mut self) -> Result<Option<i32>> {
        let Some(oldest) = self.header.oldest_slot() else {
            return CorruptionSnafu {
                path:   self.store.queue_path(),
                what:   "status header",
                reason: "buffer full but no oldest slot to evict",
            }
            .fail();
        };

        let slot = self.store.load_slot(oldest)?;
        if !slot.active || slot.offset != self.header.end_insert {
            return CorruptionSnafu {
                path:   self.store.queue_path(),
                what:   format!("slot {oldest}"),
                reason: format!(
                    "oldest message at offset {} (active {}), insert region ends at {}",
                    slot.offset, slot.active, self.header.end_insert
                ),
            }
            .fail();
        }
        if self.is_unread(slot.id) {
            return Ok(Some(slot.id));
        }

        self.store.clear_slot(oldest)?;
        self.evicted += 1;
        debug!(slot = oldest, id = slot.id, "Evicted oldest message");

        if self.header.youngest_slot() == Some(oldest) {
            // Nothing left; the whole buffer is free again.
            let header = &mut *self.header;
            header.oldest_slot = -1;
            header.begin_insert = 0;
            header.end_insert = 0;
            header.begin_append = 0;
            header.append_mode = true;
            return Ok(None);
        }

        let header = &mut *self.header;
        header.end_insert += slot.stored_len;
        if header.end_insert >= header.begin_append {
            header.begin_append = header.begin_insert;
            header.begin_insert = 0;
            header.end_insert = 0;
            header.append_mode = true;
        }
        header.oldest_slot = i32::try_from(header.next_slot(oldest)).unwrap_or(0);
        Ok(None)
    }

    /// Finds `stored_len` contiguous bytes, evicting oldest messages as
    /// needed.
    pub(crate) fn reserve(&mut self, stored_len: usize) -> Result<Placement> {
        let need = i32::try_from(stored_len).unwrap_or(i32::MAX);
        if need > self.header.buf_size {
            return FullQueueSnafu {
                stored_len,
                buf_size: self.header.buf_size(),
            }
            .fail();
        }

        loop {
            if self.header.append_mode {
                if self.header.buf_size - self.header.begin_append >= need {
                    return Ok(Placement::At(self.header.begin_append));
                }
                self.header.append_mode = false;
            }
            if self.header.end_insert - self.header.begin_insert >= need {
                return Ok(Placement::At(self.header.begin_insert));
            }
            if let Some(id) = self.evict_oldest()? {
                return Ok(Placement::Blocked { id });
            }
        }
    }
}

/// Records a message written at `offset` in `write_slot`.
pub(crate) fn commit(
    header: &mut StatusHeader,
    write_slot: usize,
    id: i32,
    offset: i32,
    stored_len: usize,
) {
    let end = offset + i32::try_from(stored_len).unwrap_or(0);
    if header.append_mode {
        header.begin_append = end;
    } else {
        header.begin_insert = end;
    }
    let slot = i32::try_from(write_slot).unwrap_or(0);
    header.youngest_slot = slot;
    header.youngest_id = id;
    if header.oldest_slot < 0 {
        header.oldest_slot = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{next_id, stored_len};

    /// In-memory slot table.
    struct Slots(Vec<Slot>);

    impl SlotStore for Slots {
        fn load_slot(&mut self, slot_num: usize) -> Result<Slot> { Ok(self.0[slot_num]) }

        fn clear_slot(&mut self, slot_num: usize) -> Result<()> {
            self.0[slot_num] = Slot::default();
            Ok(())
        }

        fn queue_path(&self) -> &str { "memory" }
    }

    struct Fixture {
        header: StatusHeader,
        slots:  Slots,
    }

    impl Fixture {
        fn new(nslots: i32, buf_size: i32) -> Self {
            Self {
                header: StatusHeader::empty(nslots, buf_size),
                slots:  Slots(vec![Slot::default(); nslots as usize]),
            }
        }

        /// Mirrors the write path: free the reused slot, reserve, commit.
        fn write(&mut self, payload_len: usize, reader: Option<i32>) -> Result<Placement> {
            let write_slot = self
                .header
                .youngest_slot()
                .map_or(0, |s| self.header.next_slot(s));
            let id = next_id(self.header.youngest_id);
            let len = stored_len(payload_len);

            let mut allocator = Allocator::new(&mut self.header, &mut self.slots, reader);
            if let Some(id) = allocator.free_slot_for_write(write_slot)? {
                return Ok(Placement::Blocked { id });
            }
            let placement = allocator.reserve(len)?;
            if let Placement::At(offset) = placement {
                commit(&mut self.header, write_slot, id, offset, len);
                self.slots.0[write_slot] = Slot {
                    active: true,
                    id,
                    stored_len: len as i32,
                    offset,
                    ..Slot::default()
                };
            }
            Ok(placement)
        }

        fn live_ids(&self) -> Vec<i32> {
            let mut ids: Vec<i32> = self.slots.0.iter().filter(|s| s.active).map(|s| s.id).collect();
            ids.sort_unstable();
            ids
        }
    }

    #[test]
    fn test_append_until_full_then_wrap() {
        // Each 28 byte payload is stored in 40 bytes; 100 bytes holds two.
        let mut fx = Fixture::new(8, 100);
        assert_eq!(fx.write(28, None).unwrap(), Placement::At(0));
        assert_eq!(fx.write(28, None).unwrap(), Placement::At(40));

        // Third message wraps to the start, evicting id 0.
        assert_eq!(fx.write(28, None).unwrap(), Placement::At(0));
        assert_eq!(fx.live_ids(), vec![1, 2]);
        assert!(!fx.header.append_mode);
        assert_eq!(fx.header.begin_insert, 40);
        assert_eq!(fx.header.end_insert, 40);

        // Fourth evicts id 1, the insert region meets begin_append and the
        // queue returns to append mode behind id 2.
        assert_eq!(fx.write(28, None).unwrap(), Placement::At(40));
        assert_eq!(fx.live_ids(), vec![2, 3]);
    }

    #[test]
    fn test_slot_reuse_evicts_oldest() {
        let mut fx = Fixture::new(4, 10_000);
        for _ in 0..6 {
            fx.write(10, None).unwrap();
        }
        assert_eq!(fx.live_ids(), vec![2, 3, 4, 5]);
        assert_eq!(fx.header.oldest_slot, 2);
        assert_eq!(fx.header.youngest_slot, 1);
    }

    #[test]
    fn test_fifo_suffix_under_mixed_sizes() {
        let mut fx = Fixture::new(16, 256);
        let sizes = [10, 60, 3, 90, 44, 7, 120, 1, 30, 64, 5, 200, 17, 80];
        for (n, &size) in sizes.iter().enumerate() {
            fx.write(size, None).unwrap();
            let ids = fx.live_ids();
            let expected: Vec<i32> = (ids[0]..=n as i32).collect();
            assert_eq!(ids, expected, "after write {n}");
            assert_eq!(*ids.last().unwrap(), n as i32);
        }
    }

    #[test]
    fn test_oversized_message_fails_without_eviction() {
        let mut fx = Fixture::new(4, 64);
        fx.write(8, None).unwrap();
        let err = fx.write(60, None).unwrap_err();
        assert!(matches!(err, crate::FmqError::FullQueue { .. }));
        assert_eq!(fx.live_ids(), vec![0]);
    }

    #[test]
    fn test_single_slot_queue() {
        let mut fx = Fixture::new(1, 64);
        for _ in 0..3 {
            assert_eq!(fx.write(20, None).unwrap(), Placement::At(0));
        }
        assert_eq!(fx.live_ids(), vec![2]);
    }

    #[test]
    fn test_unread_message_blocks_eviction() {
        let mut fx = Fixture::new(2, 10_000);
        fx.write(4, None).unwrap();
        fx.write(4, None).unwrap();

        // No reader yet: everything is unread.
        assert_eq!(fx.write(4, Some(-1)).unwrap(), Placement::Blocked { id: 0 });
        assert_eq!(fx.live_ids(), vec![0, 1]);

        // Once id 0 was read it may go.
        assert!(matches!(fx.write(4, Some(0)).unwrap(), Placement::At(_)));
        assert_eq!(fx.live_ids(), vec![1, 2]);
    }

    #[test]
    fn test_inconsistent_oldest_is_corruption() {
        let mut fx = Fixture::new(4, 64);
        fx.write(20, None).unwrap();
        fx.write(20, None).unwrap();
        fx.slots.0[0].offset = 12;
        let err = fx.write(20, None).unwrap_err();
        assert!(err.is_corruption());
    }
}
