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

//! Consistency checking and repair of a queue.
//!
//! [`check`] walks the header, the slot table and every live entry. When it
//! fails, [`repair`] applies the handle's [`RecoveryPolicy`]:
//! - `Reinitialize` discards everything and writes an empty queue
//! - `Recover` keeps the longest run of intact consecutive messages ending
//!   at the youngest one, falling back to reinitializing
//! - `Fail` returns the original error

use std::fmt;

use snafu::ensure;
use tracing::{info, warn};

use crate::{
    FmqError, Result,
    config::RecoveryPolicy,
    device::{Geometry, Region, StorageDevice},
    entry,
    error::CorruptionSnafu,
    layout::{HEADER_SIZE, MAX_ID, SLOT_SIZE, Slot, StatusHeader, now_secs, prev_id},
    table,
};

/// What [`repair`] did to a corrupted queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Emptied and resized to the configured geometry.
    Reinitialized,
    /// Rebuilt around the surviving messages.
    Recovered,
}

/// Outcome of repairing a queue, kept on the handle for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub action:        RecoveryAction,
    /// The check failure that triggered the repair.
    pub reason:        String,
    pub messages_kept: usize,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RecoveryAction::Reinitialized => "reinitialized",
            RecoveryAction::Recovered => "recovered",
        };
        write!(
            f,
            "{action}, {} messages kept ({})",
            self.messages_kept, self.reason
        )
    }
}

fn corrupt<T>(device: &dyn StorageDevice, what: &str, reason: String) -> Result<T> {
    CorruptionSnafu {
        path: device.path(),
        what,
        reason,
    }
    .fail()
}

/// Runs the full consistency check and returns the validated header.
pub(crate) fn check(device: &dyn StorageDevice) -> Result<StatusHeader> {
    let header = table::read_header(device)?;
    ensure!(
        header.nslots > 0 && header.buf_size > 0,
        CorruptionSnafu {
            path:   device.path(),
            what:   "status header",
            reason: format!(
                "geometry of {} slots and {} bytes",
                header.nslots, header.buf_size
            ),
        }
    );

    let status_len = device.region_len(Region::Status);
    let buffer_len = device.region_len(Region::Buffer);
    let expected = Geometry {
        nslots:   header.nslots(),
        buf_size: header.buf_size(),
    };
    if status_len != expected.status_len() || buffer_len != expected.buf_size {
        return corrupt(
            device,
            "region sizes",
            format!(
                "status {status_len} and buffer {buffer_len} bytes, header expects {} and {}",
                expected.status_len(),
                expected.buf_size
            ),
        );
    }

    let slots = table::read_slots(device, header.nslots())?;

    if let Some(youngest) = header.youngest_slot().filter(|_| !header.is_empty()) {
        let holds_youngest = slots
            .get(youngest)
            .is_some_and(|slot| slot.active && slot.id == header.youngest_id);
        if !holds_youngest {
            return corrupt(
                device,
                "slot table",
                format!(
                    "youngest id {} is not in slot {youngest}",
                    header.youngest_id
                ),
            );
        }
    }

    for (slot_num, slot) in slots.iter().enumerate() {
        if slot.active != header.slot_in_active_region(slot_num) {
            return corrupt(
                device,
                "slot table",
                format!(
                    "slot {slot_num} is {} but lies {} the active region",
                    if slot.active { "active" } else { "inactive" },
                    if slot.active { "outside" } else { "inside" },
                ),
            );
        }
        if slot.active {
            entry::read_body(device, slot_num, slot)?;
        }
    }

    Ok(header)
}

/// Writes an empty queue with `geometry`, resizing the regions to match.
pub(crate) fn reinitialize(device: &mut dyn StorageDevice, geometry: Geometry) -> Result<()> {
    if device.region_len(Region::Status) != geometry.status_len() {
        device.truncate_or_extend(Region::Status, geometry.status_len())?;
    }
    if device.region_len(Region::Buffer) != geometry.buf_size {
        device.truncate_or_extend(Region::Buffer, geometry.buf_size)?;
    }
    let mut header = StatusHeader::empty(
        i32::try_from(geometry.nslots).unwrap_or(i32::MAX),
        i32::try_from(geometry.buf_size).unwrap_or(i32::MAX),
    );
    header.time_written = now_secs();
    table::clear_slots(device, geometry.nslots)?;
    table::write_header(device, &header)?;
    device.flush()
}

/// Applies `policy` to a queue that failed [`check`] with `cause`.
///
/// The caller holds the writer lock.
pub(crate) fn repair(
    device: &mut dyn StorageDevice,
    policy: RecoveryPolicy,
    geometry: Geometry,
    cause: FmqError,
) -> Result<RecoveryReport> {
    let reason = cause.to_string();
    let report = match policy {
        RecoveryPolicy::Fail => return Err(cause),
        RecoveryPolicy::Recover => match salvage(&*device).and_then(|kept| {
            check(&*device)?;
            Ok(kept)
        }) {
            Ok(Some(messages_kept)) => {
                device.flush()?;
                RecoveryReport {
                    action: RecoveryAction::Recovered,
                    reason,
                    messages_kept,
                }
            }
            Ok(None) | Err(_) => {
                reinitialize(device, geometry)?;
                RecoveryReport {
                    action: RecoveryAction::Reinitialized,
                    reason,
                    messages_kept: 0,
                }
            }
        },
        RecoveryPolicy::Reinitialize => {
            reinitialize(device, geometry)?;
            RecoveryReport {
                action: RecoveryAction::Reinitialized,
                reason,
                messages_kept: 0,
            }
        }
    };

    warn!(
        path = device.path(),
        action = ?report.action,
        kept = report.messages_kept,
        reason = %report.reason,
        "Repaired corrupted queue"
    );
    Ok(report)
}

/// Picks the youngest of `ids`, which may straddle the id wraparound.
fn youngest_id(ids: &[i32], nslots: usize) -> Option<i32> {
    let window = i32::try_from(nslots).unwrap_or(MAX_ID);
    let wrapped = ids.iter().any(|&id| id < window) && ids.iter().any(|&id| id >= MAX_ID - window);
    if wrapped {
        ids.iter().copied().filter(|&id| id < MAX_ID / 2).max()
    } else {
        ids.iter().copied().max()
    }
}

/// Rebuilds the header around the longest intact run of messages ending at
/// the youngest readable one. Returns the number kept, or `None` when the
/// survivors cannot be laid out as a valid buffer.
fn salvage(device: &dyn StorageDevice) -> Result<Option<usize>> {
    let status_len = device.region_len(Region::Status);
    if status_len < HEADER_SIZE {
        return Ok(None);
    }
    let nslots = (status_len - HEADER_SIZE) / SLOT_SIZE;
    let buf_size = device.region_len(Region::Buffer);
    let (Ok(nslots_word), Ok(buf_size_word)) = (i32::try_from(nslots), i32::try_from(buf_size))
    else {
        return Ok(None);
    };
    if nslots == 0 {
        return Ok(None);
    }

    let intact: Vec<Option<Slot>> = table::read_slots_unchecked(device, nslots)?
        .into_iter()
        .enumerate()
        .map(|(slot_num, slot)| {
            slot.filter(|s| s.active && entry::read_body(device, slot_num, s).is_ok())
        })
        .collect();
    let ids: Vec<i32> = intact.iter().flatten().map(|s| s.id).collect();
    let Some(youngest) = youngest_id(&ids, nslots) else {
        return Ok(None);
    };
    let Some(youngest_slot) = intact
        .iter()
        .position(|s| s.as_ref().is_some_and(|s| s.id == youngest))
    else {
        return Ok(None);
    };

    let mut header = StatusHeader::empty(nslots_word, buf_size_word);
    header.youngest_id = youngest;
    header.youngest_slot = i32::try_from(youngest_slot).unwrap_or(0);

    // Walk back through slots holding consecutive ids.
    let mut run = vec![youngest_slot];
    let mut oldest = youngest_slot;
    let mut id = youngest;
    while run.len() < nslots {
        let prev = header.prev_slot(oldest);
        match &intact[prev] {
            Some(slot) if slot.id == prev_id(id) => {
                oldest = prev;
                id = slot.id;
                run.push(prev);
            }
            _ => break,
        }
    }
    run.reverse();
    header.oldest_slot = i32::try_from(oldest).unwrap_or(0);

    let spans: Vec<(i32, i32)> = run
        .iter()
        .filter_map(|&n| intact[n].as_ref())
        .map(|s| (s.offset, s.offset + s.stored_len))
        .collect();
    let mut wrap = None;
    for i in 1..spans.len() {
        if spans[i].0 < spans[i - 1].0 {
            if wrap.is_some() {
                return Ok(None);
            }
            wrap = Some(i);
        } else if spans[i].0 < spans[i - 1].1 {
            return Ok(None);
        }
    }
    let (first, last) = (spans[0], spans[spans.len() - 1]);
    match wrap {
        None => {
            header.append_mode = true;
            header.begin_append = last.1;
            header.begin_insert = 0;
            header.end_insert = first.0;
        }
        Some(w) => {
            if spans[w].0 != 0 || last.1 > first.0 {
                return Ok(None);
            }
            header.append_mode = false;
            header.begin_insert = last.1;
            header.end_insert = first.0;
            header.begin_append = spans[w - 1].1;
        }
    }
    header.time_written = now_secs();

    for slot_num in 0..nslots {
        if !run.contains(&slot_num) {
            table::write_slot(device, slot_num, &Slot::default())?;
        }
    }
    table::write_header(device, &header)?;
    info!(
        path = device.path(),
        kept = run.len(),
        youngest_id = youngest,
        "Rebuilt queue header from surviving messages"
    );
    Ok(Some(run.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::commit,
        device::{Access, FileDevice},
        layout::{next_id, stored_len},
    };

    const GEOMETRY: Geometry = Geometry {
        nslots:   8,
        buf_size: 1024,
    };

    fn device() -> (tempfile::TempDir, FileDevice) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue").display().to_string();
        let mut device = FileDevice::open(&path, Access::Create(GEOMETRY)).unwrap();
        reinitialize(&mut device, GEOMETRY).unwrap();
        (temp_dir, device)
    }

    /// Appends `count` messages of `len` bytes without wrapping the buffer.
    fn populate(device: &FileDevice, count: usize, len: usize) {
        let mut header = table::read_header(device).unwrap();
        for n in 0..count {
            let write_slot = header.youngest_slot().map_or(0, |s| header.next_slot(s));
            let id = next_id(header.youngest_id);
            let offset = header.begin_append;
            let stored = stored_len(len);
            let entry = entry::encode(write_slot as i32, id, &vec![n as u8; len]);
            device.write(Region::Buffer, offset as usize, &entry).unwrap();
            let slot = Slot {
                active: true,
                id,
                msg_len: len as i32,
                stored_len: stored as i32,
                offset,
                ..Default::default()
            };
            table::write_slot(device, write_slot, &slot).unwrap();
            commit(&mut header, write_slot, id, offset, stored);
        }
        table::write_header(device, &header).unwrap();
    }

    fn slot_offset_of(device: &FileDevice, slot_num: usize) -> usize {
        table::read_slot(device, slot_num).unwrap().offset()
    }

    #[test]
    fn test_check_accepts_written_queue() {
        let (_dir, device) = device();
        check(&device).unwrap();
        populate(&device, 5, 30);
        let header = check(&device).unwrap();
        assert_eq!(header.youngest_id, 4);
        assert_eq!(header.active_slot_count(), 5);
    }

    #[test]
    fn test_check_rejects_stray_active_slot() {
        let (_dir, device) = device();
        populate(&device, 3, 30);
        let stray = Slot {
            active: true,
            id: 77,
            stored_len: 44,
            ..Default::default()
        };
        table::write_slot(&device, 6, &stray).unwrap();
        assert!(check(&device).unwrap_err().is_corruption());
    }

    #[test]
    fn test_check_rejects_damaged_entry() {
        let (_dir, device) = device();
        populate(&device, 3, 30);
        let offset = slot_offset_of(&device, 1);
        device.write(Region::Buffer, offset, &[0xFF; 4]).unwrap();
        assert!(check(&device).unwrap_err().is_corruption());
    }

    #[test]
    fn test_fail_policy_returns_cause() {
        let (_dir, mut device) = device();
        device.write(Region::Status, 4, &[0xAB; 4]).unwrap();
        let cause = check(&device).unwrap_err();
        let err = repair(&mut device, RecoveryPolicy::Fail, GEOMETRY, cause).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_reinitialize_policy_resizes() {
        let (_dir, mut device) = device();
        populate(&device, 4, 30);
        device.write(Region::Status, 4, &[0xAB; 4]).unwrap();
        let cause = check(&device).unwrap_err();

        let geometry = Geometry {
            nslots:   16,
            buf_size: 2048,
        };
        let report = repair(&mut device, RecoveryPolicy::Reinitialize, geometry, cause).unwrap();
        assert_eq!(report.action, RecoveryAction::Reinitialized);
        assert_eq!(report.messages_kept, 0);

        let header = check(&device).unwrap();
        assert!(header.is_empty());
        assert_eq!(header.nslots(), 16);
        assert_eq!(device.region_len(Region::Buffer), 2048);
    }

    #[test]
    fn test_recover_rebuilds_damaged_header() {
        let (_dir, mut device) = device();
        populate(&device, 5, 30);
        device.write(Region::Status, 0, &[0u8; HEADER_SIZE]).unwrap();
        let cause = check(&device).unwrap_err();

        let report = repair(&mut device, RecoveryPolicy::Recover, GEOMETRY, cause).unwrap();
        assert_eq!(report.action, RecoveryAction::Recovered);
        assert_eq!(report.messages_kept, 5);

        let header = check(&device).unwrap();
        assert_eq!(header.youngest_id, 4);
        assert_eq!(header.oldest_slot, 0);
        assert!(header.append_mode);
        assert_eq!(header.begin_append, 5 * stored_len(30) as i32);
    }

    #[test]
    fn test_recover_keeps_run_after_damaged_entry() {
        let (_dir, mut device) = device();
        populate(&device, 5, 30);
        let offset = slot_offset_of(&device, 1);
        device.write(Region::Buffer, offset, &[0xFF; 4]).unwrap();
        let cause = check(&device).unwrap_err();

        let report = repair(&mut device, RecoveryPolicy::Recover, GEOMETRY, cause).unwrap();
        assert_eq!(report.messages_kept, 3);

        let header = check(&device).unwrap();
        assert_eq!(header.oldest_slot, 2);
        assert_eq!(header.end_insert, slot_offset_of(&device, 2) as i32);
        assert!(!table::read_slot(&device, 0).unwrap().active);
    }

    #[test]
    fn test_recover_without_survivors_reinitializes() {
        let (_dir, mut device) = device();
        populate(&device, 2, 30);
        device.write(Region::Buffer, 0, &[0u8; 128]).unwrap();
        let cause = check(&device).unwrap_err();

        let report = repair(&mut device, RecoveryPolicy::Recover, GEOMETRY, cause).unwrap();
        assert_eq!(report.action, RecoveryAction::Reinitialized);
        assert!(check(&device).unwrap().is_empty());
    }

    #[test]
    fn test_youngest_across_wraparound() {
        assert_eq!(youngest_id(&[3, 4, 5], 8), Some(5));
        assert_eq!(youngest_id(&[MAX_ID - 2, MAX_ID - 1, 0, 1], 8), Some(1));
        assert_eq!(youngest_id(&[], 8), None);
    }
}
