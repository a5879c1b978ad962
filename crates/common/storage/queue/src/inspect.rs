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

//! Diagnostic dump of a queue.
//!
//! [`QueueReport`] reads the header and every slot without validation, so a
//! damaged queue can still be examined. Faults are reported next to the
//! records they affect.

use std::fmt;

use snafu::ensure;

use crate::{
    Result,
    device::{Access, DeviceKind, Region, device_exists, open_device},
    entry,
    error::NotFoundSnafu,
    layout::{HEADER_SIZE, SLOT_SIZE, Slot, StatusHeader, secs_to_time},
    table,
};

/// One slot of a [`QueueReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub slot_num: usize,
    pub slot:     Slot,
    /// Why the slot record or its entry failed validation.
    pub fault:    Option<String>,
}

/// Snapshot of a queue's status region.
#[derive(Debug, Clone)]
pub struct QueueReport {
    pub path:         String,
    pub kind:         DeviceKind,
    pub status_len:   usize,
    pub buffer_len:   usize,
    pub header:       StatusHeader,
    pub header_fault: Option<String>,
    pub slots:        Vec<SlotReport>,
    show_all:         bool,
}

impl QueueReport {
    /// Reads the queue at `path` without taking the lock.
    pub fn load(path: &str) -> Result<Self> {
        ensure!(device_exists(path), NotFoundSnafu { path });
        let device = open_device(path, Access::ReadOnly)?;
        let status_len = device.region_len(Region::Status);
        let buffer_len = device.region_len(Region::Buffer);

        let (header, header_fault) = match table::read_header(device.as_ref()) {
            Ok(header) => (header, None),
            Err(e) => (
                table::read_header_unchecked(device.as_ref())?,
                Some(e.to_string()),
            ),
        };

        let nslots = status_len.saturating_sub(HEADER_SIZE) / SLOT_SIZE;
        let raw = table::read_slots_raw(device.as_ref(), nslots)?;
        let checked = table::read_slots_unchecked(device.as_ref(), nslots)?;
        let slots = raw
            .into_iter()
            .zip(checked)
            .enumerate()
            .map(|(slot_num, (slot, valid))| {
                let fault = match valid {
                    None => Some("bad checksum".to_string()),
                    Some(slot) if slot.active => entry::read_body(device.as_ref(), slot_num, &slot)
                        .err()
                        .map(|e| e.to_string()),
                    Some(_) => None,
                };
                SlotReport {
                    slot_num,
                    slot,
                    fault,
                }
            })
            .collect();

        Ok(Self {
            path: path.to_string(),
            kind: device.kind(),
            status_len,
            buffer_len,
            header,
            header_fault,
            slots,
            show_all: false,
        })
    }

    /// Include inactive slots in the printed table.
    #[must_use]
    pub const fn with_all_slots(mut self, show_all: bool) -> Self {
        self.show_all = show_all;
        self
    }

    #[must_use]
    pub fn active_slots(&self) -> usize { self.slots.iter().filter(|s| s.slot.active).count() }

    /// Whether the header or any slot failed validation.
    #[must_use]
    pub fn has_faults(&self) -> bool {
        self.header_fault.is_some() || self.slots.iter().any(|s| s.fault.is_some())
    }
}

impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "Queue {} ({:?})", self.path, self.kind)?;
        writeln!(
            f,
            "  regions:       status {} bytes, buffer {} bytes",
            self.status_len, self.buffer_len
        )?;
        match &self.header_fault {
            Some(fault) => writeln!(f, "  header:        CORRUPT ({fault})")?,
            None => writeln!(f, "  header:        ok")?,
        }
        writeln!(f, "  nslots:        {}", h.nslots)?;
        writeln!(f, "  buf_size:      {}", h.buf_size)?;
        writeln!(
            f,
            "  youngest:      id {} in slot {}",
            h.youngest_id, h.youngest_slot
        )?;
        writeln!(f, "  oldest slot:   {}", h.oldest_slot)?;
        writeln!(
            f,
            "  insert region: [{}, {})  append from {}  mode {}",
            h.begin_insert,
            h.end_insert,
            h.begin_append,
            if h.append_mode { "append" } else { "insert" }
        )?;
        writeln!(f, "  time written:  {}", secs_to_time(h.time_written).to_rfc3339())?;
        writeln!(
            f,
            "  blocking:      {}  last id read {}",
            h.blocking_write, h.last_id_read
        )?;
        writeln!(f, "  active slots:  {}", self.active_slots())?;

        writeln!(
            f,
            "{:>6} {:>10} {:>6} {:>7} {:>8} {:>8} {:>8} {:>4}  {:<25} fault",
            "slot", "id", "type", "subtype", "msg_len", "stored", "offset", "cmp", "time"
        )?;
        for report in &self.slots {
            let s = &report.slot;
            if !(s.active || self.show_all || report.fault.is_some()) {
                continue;
            }
            writeln!(
                f,
                "{:>6} {:>10} {:>6} {:>7} {:>8} {:>8} {:>8} {:>4}  {:<25} {}",
                report.slot_num,
                s.id,
                s.msg_type,
                s.subtype,
                s.msg_len,
                s.stored_len,
                s.offset,
                if s.compress { "y" } else { "n" },
                s.time().to_rfc3339(),
                report.fault.as_deref().unwrap_or(if s.active { "" } else { "inactive" }),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueBuilder;

    #[test]
    fn test_report_lists_active_slots() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue").display().to_string();
        let mut queue = QueueBuilder::new(&path).num_slots(4).buf_size(1024).build().unwrap();
        queue.write(5, 1, b"alpha").unwrap();
        queue.write(6, 2, b"beta").unwrap();

        let report = QueueReport::load(&path).unwrap();
        assert!(!report.has_faults());
        assert_eq!(report.active_slots(), 2);
        assert_eq!(report.header.youngest_id, 1);

        let text = report.to_string();
        assert!(text.contains("header:        ok"));
        assert_eq!(text.lines().filter(|l| l.ends_with(' ')).count(), 2);
        let all = QueueReport::load(&path).unwrap().with_all_slots(true).to_string();
        assert_eq!(all.matches("inactive").count(), 2);
    }

    #[test]
    fn test_report_survives_corrupt_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue").display().to_string();
        let mut queue = QueueBuilder::new(&path).num_slots(4).buf_size(1024).build().unwrap();
        queue.write(5, 1, b"alpha").unwrap();
        queue.device.write(Region::Status, 8, &[0x7F; 4]).unwrap();

        let report = QueueReport::load(&path).unwrap();
        assert!(report.has_faults());
        assert!(report.to_string().contains("CORRUPT"));
    }

    #[test]
    fn test_missing_queue() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent").display().to_string();
        assert!(QueueReport::load(&path).unwrap_err().is_device());
    }
}
