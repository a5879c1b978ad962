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

//! Framing of messages inside the data buffer.
//!
//! ## Entry Format
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────┬──────────┬─────────────┐
//! │ Cookie (4B)  │ Slot no (4B) │ Body (variable)        │ Pad 0-3B │ Id (4B)     │
//! │ big-endian   │ big-endian   │ raw or compressed      │ zeros    │ big-endian  │
//! └──────────────┴──────────────┴────────────────────────┴──────────┴─────────────┘
//! ```
//!
//! The leading cookie and slot number and the trailing id repeat what the
//! slot record says, so a reader can tell a complete entry from one that was
//! overwritten or only partly written.

use std::fmt;

use bytes::Bytes;
use snafu::ensure;

use crate::{
    Result,
    device::{Region, StorageDevice},
    error::CorruptionSnafu,
    layout::{BUFFER_MAGIC, ENTRY_OVERHEAD, Slot, stored_len},
};

const BODY_START: usize = 8;

/// Frames `body` for slot `slot_num` and message `id`.
pub(crate) fn encode(slot_num: i32, id: i32, body: &[u8]) -> Vec<u8> {
    let total = stored_len(body.len());
    let mut entry = Vec::with_capacity(total);
    entry.extend_from_slice(&BUFFER_MAGIC.to_be_bytes());
    entry.extend_from_slice(&slot_num.to_be_bytes());
    entry.extend_from_slice(body);
    entry.resize(total - 4, 0);
    entry.extend_from_slice(&id.to_be_bytes());
    entry
}

/// Why an entry failed its marker checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryFault {
    Length { len: usize },
    Magic { found: i32 },
    SlotNumber { expected: i32, found: i32 },
    TrailingId { expected: i32, found: i32 },
}

impl fmt::Display for EntryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length { len } => write!(f, "entry of {len} bytes is malformed"),
            Self::Magic { found } => {
                write!(f, "entry cookie {found} does not match {BUFFER_MAGIC}")
            }
            Self::SlotNumber { expected, found } => {
                write!(f, "entry belongs to slot {found}, expected {expected}")
            }
            Self::TrailingId { expected, found } => {
                write!(f, "entry ends with id {found}, expected {expected}")
            }
        }
    }
}

fn word_at(entry: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([entry[at], entry[at + 1], entry[at + 2], entry[at + 3]])
}

/// Validates the markers of `entry` and returns its padded body.
pub(crate) fn body(entry: &[u8], slot_num: i32, id: i32) -> Result<&[u8], EntryFault> {
    let len = entry.len();
    if len < ENTRY_OVERHEAD || len % 4 != 0 {
        return Err(EntryFault::Length { len });
    }

    let magic = word_at(entry, 0);
    if magic != BUFFER_MAGIC {
        return Err(EntryFault::Magic { found: magic });
    }
    let found_slot = word_at(entry, 4);
    if found_slot != slot_num {
        return Err(EntryFault::SlotNumber {
            expected: slot_num,
            found:    found_slot,
        });
    }
    let found_id = word_at(entry, len - 4);
    if found_id != id {
        return Err(EntryFault::TrailingId {
            expected: id,
            found:    found_id,
        });
    }

    Ok(&entry[BODY_START..len - 4])
}

/// Loads the entry described by `slot` and returns its padded body.
pub(crate) fn read_body(device: &dyn StorageDevice, slot_num: usize, slot: &Slot) -> Result<Bytes> {
    let what = || format!("entry of slot {slot_num}");
    let offset = slot.offset();
    let len = slot.stored_len();
    ensure!(
        slot.offset >= 0
            && len >= ENTRY_OVERHEAD
            && offset + len <= device.region_len(Region::Buffer),
        CorruptionSnafu {
            path:   device.path(),
            what:   what(),
            reason: format!("{len} bytes at offset {} overrun the buffer", slot.offset),
        }
    );

    let raw = Bytes::from(device.read_vec(Region::Buffer, offset, len)?);
    let slot_tag = i32::try_from(slot_num).unwrap_or(-1);
    if let Err(fault) = body(&raw, slot_tag, slot.id) {
        return CorruptionSnafu {
            path:   device.path(),
            what:   what(),
            reason: fault.to_string(),
        }
        .fail();
    }
    Ok(raw.slice(BODY_START..len - 4))
}
