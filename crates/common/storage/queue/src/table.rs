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

//! Checksummed reads and writes of the status header and slot table.
//!
//! Readers never hold the writer lock, so a record may be caught halfway
//! through an update. Failed validations are retried a few times before the
//! record is declared corrupt.

use std::thread;

use snafu::ensure;

use crate::{
    Result,
    device::{Region, StorageDevice},
    error::CorruptionSnafu,
    layout::{HEADER_SIZE, RecordFault, SLOT_SIZE, Slot, StatusHeader, slot_offset},
};

/// Attempts made before a failing record is reported as corrupt.
pub(crate) const READ_ATTEMPTS: usize = 5;

fn retry_decode<T, const N: usize>(
    device: &dyn StorageDevice,
    offset: usize,
    what: &str,
    decode: impl Fn(&[u8; N]) -> Result<T, RecordFault>,
) -> Result<T> {
    let mut bytes = [0u8; N];
    let mut fault = None;
    for attempt in 0..READ_ATTEMPTS {
        if attempt > 0 {
            thread::yield_now();
        }
        device.read(Region::Status, offset, &mut bytes)?;
        match decode(&bytes) {
            Ok(record) => return Ok(record),
            Err(e) => fault = Some(e),
        }
    }
    CorruptionSnafu {
        path:   device.path(),
        what,
        reason: fault.map(|f| f.to_string()).unwrap_or_default(),
    }
    .fail()
}

/// Reads and validates the status header.
pub(crate) fn read_header(device: &dyn StorageDevice) -> Result<StatusHeader> {
    retry_decode(device, 0, "status header", StatusHeader::decode)
}

/// Reads the status header without validation.
pub(crate) fn read_header_unchecked(device: &dyn StorageDevice) -> Result<StatusHeader> {
    let mut bytes = [0u8; HEADER_SIZE];
    device.read(Region::Status, 0, &mut bytes)?;
    Ok(StatusHeader::decode_unchecked(&bytes))
}

pub(crate) fn write_header(device: &dyn StorageDevice, header: &StatusHeader) -> Result<()> {
    device.write(Region::Status, 0, &header.encode())
}

/// Reads and validates slot `slot_num`.
pub(crate) fn read_slot(device: &dyn StorageDevice, slot_num: usize) -> Result<Slot> {
    retry_decode(
        device,
        slot_offset(slot_num),
        &format!("slot {slot_num}"),
        Slot::decode,
    )
}

pub(crate) fn write_slot(device: &dyn StorageDevice, slot_num: usize, slot: &Slot) -> Result<()> {
    device.write(Region::Status, slot_offset(slot_num), &slot.encode())
}

/// Reads every slot, validating each one.
pub(crate) fn read_slots(device: &dyn StorageDevice, nslots: usize) -> Result<Vec<Slot>> {
    let raw = read_slot_table(device, nslots)?;
    raw.chunks_exact(SLOT_SIZE)
        .enumerate()
        .map(|(slot_num, chunk)| {
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(chunk);
            match Slot::decode(&bytes) {
                Ok(slot) => Ok(slot),
                // Possibly torn by a concurrent writer, give it another look.
                Err(_) => read_slot(device, slot_num),
            }
        })
        .collect()
}

/// Reads every slot without validation, for diagnostics and recovery.
pub(crate) fn read_slots_unchecked(
    device: &dyn StorageDevice,
    nslots: usize,
) -> Result<Vec<Option<Slot>>> {
    let raw = read_slot_table(device, nslots)?;
    Ok(raw
        .chunks_exact(SLOT_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(chunk);
            Slot::decode(&bytes).ok()
        })
        .collect())
}

/// Every slot decoded without any validation.
pub(crate) fn read_slots_raw(device: &dyn StorageDevice, nslots: usize) -> Result<Vec<Slot>> {
    let raw = read_slot_table(device, nslots)?;
    Ok(raw
        .chunks_exact(SLOT_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(chunk);
            Slot::decode_unchecked(&bytes)
        })
        .collect())
}

fn read_slot_table(device: &dyn StorageDevice, nslots: usize) -> Result<Vec<u8>> {
    let len = nslots * SLOT_SIZE;
    ensure!(
        HEADER_SIZE + len <= device.region_len(Region::Status),
        CorruptionSnafu {
            path:   device.path(),
            what:   "slot table",
            reason: format!(
                "{nslots} slots do not fit a status region of {} bytes",
                device.region_len(Region::Status)
            ),
        }
    );
    device.read_vec(Region::Status, HEADER_SIZE, len)
}

/// Writes every slot as an inactive, zeroed record.
pub(crate) fn clear_slots(device: &dyn StorageDevice, nslots: usize) -> Result<()> {
    let zeroed = Slot::default().encode();
    let table: Vec<u8> = zeroed.iter().copied().cycle().take(nslots * SLOT_SIZE).collect();
    device.write(Region::Status, HEADER_SIZE, &table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Access, FileDevice, Geometry};

    fn device(nslots: usize) -> (tempfile::TempDir, FileDevice) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q").display().to_string();
        let device = FileDevice::open(
            &path,
            Access::Create(Geometry {
                nslots,
                buf_size: 256,
            }),
        )
        .unwrap();
        (temp_dir, device)
    }

    #[test]
    fn test_header_and_slots_persist() {
        let (_dir, device) = device(3);
        let mut header = StatusHeader::empty(3, 256);
        header.youngest_id = 0;
        header.youngest_slot = 0;
        header.oldest_slot = 0;
        write_header(&device, &header).unwrap();
        clear_slots(&device, 3).unwrap();

        let slot = Slot {
            active: true,
            id: 0,
            msg_len: 4,
            stored_len: 16,
            msg_type: 1,
            ..Slot::default()
        };
        write_slot(&device, 0, &slot).unwrap();

        let read = read_header(&device).unwrap();
        assert_eq!(read.youngest_id, 0);
        let slots = read_slots(&device, 3).unwrap();
        assert!(slots[0].active);
        assert!(!slots[1].active);
        assert_eq!(read_slot(&device, 0).unwrap().stored_len, 16);
    }

    #[test]
    fn test_corrupt_slot_is_reported() {
        let (_dir, device) = device(2);
        clear_slots(&device, 2).unwrap();
        device.write(Region::Status, slot_offset(1) + 5, &[0xFF]).unwrap();

        let err = read_slot(&device, 1).unwrap_err();
        assert!(err.is_corruption());
        assert!(read_slots(&device, 2).unwrap_err().is_corruption());
        let lenient = read_slots_unchecked(&device, 2).unwrap();
        assert!(lenient[0].is_some());
        assert!(lenient[1].is_none());
    }

    #[test]
    fn test_unwritten_header_is_corrupt() {
        let (_dir, device) = device(1);
        // A zero-filled header never validates.
        let err = read_header(&device).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(read_header_unchecked(&device).unwrap().magic_cookie, 0);
    }
}
