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

//! Persisted layout of the status header and slot table.
//!
//! ## Status region
//!
//! ```text
//! ┌──────────────────────────┬─────────────┬─────────────┬─────┬─────────────┐
//! │  Status header (56B)     │  Slot 0     │  Slot 1     │ ... │  Slot n-1   │
//! │  14 x i32 big-endian     │  10 x i32   │  10 x i32   │     │  10 x i32   │
//! └──────────────────────────┴─────────────┴─────────────┴─────┴─────────────┘
//! ```
//!
//! Every field is a 4-byte signed big-endian integer. Both record kinds end
//! with an additive checksum (see [`crate::checksum`]).
//!
//! ## Buffer region
//!
//! A circular byte arena of `buf_size` bytes holding framed entries (see
//! [`crate::entry`]).

use std::fmt;

use chrono::{DateTime, Utc};

use crate::checksum::{header_checksum, slot_checksum};

/// Magic cookie stored at the start of a valid status header.
pub const STATUS_MAGIC: i32 = 88_008_801;

/// Magic cookie leading every entry in the data buffer.
pub const BUFFER_MAGIC: i32 = 88_008_802;

/// Message ids wrap to zero when they reach this value.
pub const MAX_ID: i32 = 1_000_000_000;

pub const HEADER_SIZE: usize = 56;
pub const SLOT_SIZE: usize = 40;

/// Leading cookie, slot number and trailing id.
pub const ENTRY_OVERHEAD: usize = 12;

/// Byte offset of `last_id_read` inside the header.
pub(crate) const LAST_ID_READ_OFFSET: usize = 48;

const HEADER_WORDS: usize = HEADER_SIZE / 4;
const SLOT_WORDS: usize = SLOT_SIZE / 4;

/// Bytes a payload of `payload_len` occupies in the buffer.
#[must_use]
pub const fn stored_len(payload_len: usize) -> usize {
    payload_len.div_ceil(4) * 4 + ENTRY_OVERHEAD
}

/// Size of the status region for `nslots` slots.
#[must_use]
pub const fn status_region_len(nslots: usize) -> usize { HEADER_SIZE + nslots * SLOT_SIZE }

/// Byte offset of slot `slot_num` inside the status region.
#[must_use]
pub const fn slot_offset(slot_num: usize) -> usize { HEADER_SIZE + slot_num * SLOT_SIZE }

#[must_use]
pub const fn next_id(id: i32) -> i32 { if id >= MAX_ID - 1 { 0 } else { id + 1 } }

#[must_use]
pub const fn prev_id(id: i32) -> i32 { if id <= 0 { MAX_ID - 1 } else { id - 1 } }

/// Steps needed to go from id `from` forward to id `to`.
#[must_use]
pub const fn id_distance(from: i32, to: i32) -> i32 { (to - from).rem_euclid(MAX_ID) }

/// Current time as the 4-byte seconds value stored on disk.
pub(crate) fn now_secs() -> i32 { i32::try_from(Utc::now().timestamp()).unwrap_or(i32::MAX) }

/// Converts a stored seconds value back into a timestamp.
#[must_use]
pub fn secs_to_time(secs: i32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

/// Why a record failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFault {
    Checksum { stored: i32, computed: i32 },
    Magic { found: i32 },
}

impl fmt::Display for RecordFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checksum { stored, computed } => {
                write!(f, "checksum {stored} does not match computed {computed}")
            }
            Self::Magic { found } => {
                write!(f, "magic cookie {found} does not match {STATUS_MAGIC}")
            }
        }
    }
}

fn read_words<const N: usize>(bytes: &[u8]) -> [i32; N] {
    let mut words = [0i32; N];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

fn write_words<const B: usize>(words: &[i32]) -> [u8; B] {
    let mut bytes = [0u8; B];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// The queue's shared control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHeader {
    pub magic_cookie:   i32,
    pub youngest_id:    i32,
    pub youngest_slot:  i32,
    pub oldest_slot:    i32,
    pub nslots:         i32,
    pub buf_size:       i32,
    pub begin_insert:   i32,
    pub end_insert:     i32,
    pub begin_append:   i32,
    pub append_mode:    bool,
    pub time_written:   i32,
    pub blocking_write: bool,
    pub last_id_read:   i32,
    pub checksum:       i32,
}

impl StatusHeader {
    /// Header of a freshly initialized, empty queue.
    #[must_use]
    pub const fn empty(nslots: i32, buf_size: i32) -> Self {
        Self {
            magic_cookie: STATUS_MAGIC,
            youngest_id: -1,
            youngest_slot: -1,
            oldest_slot: -1,
            nslots,
            buf_size,
            begin_insert: 0,
            end_insert: 0,
            begin_append: 0,
            append_mode: true,
            time_written: 0,
            blocking_write: false,
            last_id_read: -1,
            checksum: 0,
        }
    }

    fn words(&self) -> [i32; HEADER_WORDS] {
        [
            self.magic_cookie,
            self.youngest_id,
            self.youngest_slot,
            self.oldest_slot,
            self.nslots,
            self.buf_size,
            self.begin_insert,
            self.end_insert,
            self.begin_append,
            i32::from(self.append_mode),
            self.time_written,
            i32::from(self.blocking_write),
            self.last_id_read,
            self.checksum,
        ]
    }

    fn from_words(w: &[i32; HEADER_WORDS]) -> Self {
        Self {
            magic_cookie:   w[0],
            youngest_id:    w[1],
            youngest_slot:  w[2],
            oldest_slot:    w[3],
            nslots:         w[4],
            buf_size:       w[5],
            begin_insert:   w[6],
            end_insert:     w[7],
            begin_append:   w[8],
            append_mode:    w[9] != 0,
            time_written:   w[10],
            blocking_write: w[11] != 0,
            last_id_read:   w[12],
            checksum:       w[13],
        }
    }

    /// Encodes the header with a freshly computed checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut words = self.words();
        words[HEADER_WORDS - 1] = header_checksum(&words[..HEADER_WORDS - 1]);
        write_words(&words)
    }

    /// Decodes and validates checksum and magic cookie.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, RecordFault> {
        let words: [i32; HEADER_WORDS] = read_words(bytes);
        let computed = header_checksum(&words[..HEADER_WORDS - 1]);
        let stored = words[HEADER_WORDS - 1];
        if computed != stored {
            return Err(RecordFault::Checksum { stored, computed });
        }
        if words[0] != STATUS_MAGIC {
            return Err(RecordFault::Magic { found: words[0] });
        }
        Ok(Self::from_words(&words))
    }

    /// Decodes without any validation, for diagnostics on damaged queues.
    #[must_use]
    pub fn decode_unchecked(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self::from_words(&read_words(bytes))
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.youngest_id < 0 || self.oldest_slot < 0 }

    #[must_use]
    pub fn nslots(&self) -> usize { usize::try_from(self.nslots).unwrap_or(0) }

    #[must_use]
    pub fn buf_size(&self) -> usize { usize::try_from(self.buf_size).unwrap_or(0) }

    #[must_use]
    pub fn youngest_slot(&self) -> Option<usize> { usize::try_from(self.youngest_slot).ok() }

    #[must_use]
    pub fn oldest_slot(&self) -> Option<usize> { usize::try_from(self.oldest_slot).ok() }

    #[must_use]
    pub fn next_slot(&self, slot_num: usize) -> usize { (slot_num + 1) % self.nslots().max(1) }

    #[must_use]
    pub fn prev_slot(&self, slot_num: usize) -> usize {
        let nslots = self.nslots().max(1);
        (slot_num + nslots - 1) % nslots
    }

    /// Whether `slot_num` lies between the oldest and youngest slots,
    /// inclusive, walking forward around the ring.
    #[must_use]
    pub fn slot_in_active_region(&self, slot_num: usize) -> bool {
        let (Some(oldest), Some(youngest)) = (self.oldest_slot(), self.youngest_slot()) else {
            return false;
        };
        if youngest >= oldest {
            (oldest..=youngest).contains(&slot_num)
        } else {
            slot_num >= oldest || slot_num <= youngest
        }
    }

    /// Number of slots between oldest and youngest, inclusive.
    #[must_use]
    pub fn active_slot_count(&self) -> usize {
        match (self.oldest_slot(), self.youngest_slot()) {
            (Some(oldest), Some(youngest)) if youngest >= oldest => youngest - oldest + 1,
            (Some(oldest), Some(youngest)) => self.nslots() - oldest + youngest + 1,
            _ => 0,
        }
    }
}

/// Metadata for one stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub active:     bool,
    pub id:         i32,
    pub time:       i32,
    /// Uncompressed payload length.
    pub msg_len:    i32,
    pub stored_len: i32,
    pub offset:     i32,
    pub msg_type:   i32,
    pub subtype:    i32,
    pub compress:   bool,
    pub checksum:   i32,
}

impl Slot {
    fn words(&self) -> [i32; SLOT_WORDS] {
        [
            i32::from(self.active),
            self.id,
            self.time,
            self.msg_len,
            self.stored_len,
            self.offset,
            self.msg_type,
            self.subtype,
            i32::from(self.compress),
            self.checksum,
        ]
    }

    fn from_words(w: &[i32; SLOT_WORDS]) -> Self {
        Self {
            active:     w[0] != 0,
            id:         w[1],
            time:       w[2],
            msg_len:    w[3],
            stored_len: w[4],
            offset:     w[5],
            msg_type:   w[6],
            subtype:    w[7],
            compress:   w[8] != 0,
            checksum:   w[9],
        }
    }

    /// Encodes the slot with a freshly computed checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut words = self.words();
        words[SLOT_WORDS - 1] = slot_checksum(&words[..SLOT_WORDS - 1]);
        write_words(&words)
    }

    pub fn decode(bytes: &[u8; SLOT_SIZE]) -> Result<Self, RecordFault> {
        let words: [i32; SLOT_WORDS] = read_words(bytes);
        let computed = slot_checksum(&words[..SLOT_WORDS - 1]);
        let stored = words[SLOT_WORDS - 1];
        if computed != stored {
            return Err(RecordFault::Checksum { stored, computed });
        }
        Ok(Self::from_words(&words))
    }

    #[must_use]
    pub fn decode_unchecked(bytes: &[u8; SLOT_SIZE]) -> Self {
        Self::from_words(&read_words(bytes))
    }

    #[must_use]
    pub fn offset(&self) -> usize { usize::try_from(self.offset).unwrap_or(0) }

    #[must_use]
    pub fn stored_len(&self) -> usize { usize::try_from(self.stored_len).unwrap_or(0) }

    #[must_use]
    pub fn msg_len(&self) -> usize { usize::try_from(self.msg_len).unwrap_or(0) }

    #[must_use]
    pub fn time(&self) -> DateTime<Utc> { secs_to_time(self.time) }
}
