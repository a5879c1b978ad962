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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    Result,
    compression::CompressionMethod,
    error::InvalidConfigSnafu,
    layout::{ENTRY_OVERHEAD, SLOT_SIZE, status_region_len},
};

/// How a handle attaches to its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Always initialize a fresh queue, discarding any existing one.
    Create,
    /// Attach to an existing queue, creating it when missing.
    #[default]
    ReadWrite,
    /// Attach to an existing queue for reading only.
    ReadOnly,
    /// Wait until the queue exists, then attach for reading.
    BlockingReadOnly,
    /// Wait until the queue exists, then attach for reading and writing.
    BlockingReadWrite,
}

impl OpenMode {
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Create | Self::ReadWrite | Self::BlockingReadWrite)
    }

    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::BlockingReadOnly | Self::BlockingReadWrite)
    }
}

/// Where a freshly opened handle starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenPosition {
    /// Before the oldest message still in the queue.
    Start,
    /// After the youngest message, so only new writes are read.
    #[default]
    End,
}

/// What a writable open does with a queue that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Discard everything and start an empty queue.
    #[default]
    Reinitialize,
    /// Salvage the intact messages, reinitializing when that fails.
    Recover,
    /// Leave the queue untouched and return the corruption error.
    Fail,
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue path. A final component containing `shmem` and ending in
    /// `_<key>` selects shared memory.
    pub path: String,

    pub mode: OpenMode,

    pub position: OpenPosition,

    /// Compress payloads on write.
    pub compress: bool,

    pub compression_method: CompressionMethod,

    /// Slot count used when the queue is created.
    #[default = 1000]
    pub num_slots: usize,

    /// Data buffer size used when the queue is created.
    #[default = 100_000]
    pub buf_size: usize,

    /// Sleep between polls of blocking reads and writes. Falls back to the
    /// backend's default when unset.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    /// Sleep between attempts of a blocking open.
    #[serde(with = "humantime_serde")]
    #[default(_code = "Duration::from_secs(1)")]
    pub open_poll_interval: Duration,

    /// Limit for blocking reads and blocking opens. `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub blocking_read_timeout: Option<Duration>,

    /// Limit for a blocking write waiting on a slow reader.
    #[serde(with = "humantime_serde")]
    pub blocking_write_timeout: Option<Duration>,

    /// Limit for acquiring the writer lock. `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Option<Duration>,

    /// The caller guarantees no other writer exists, so locking is skipped.
    pub single_writer: bool,

    /// Block instead of evicting messages the reader has not read yet.
    pub blocking_write: bool,

    pub recovery_policy: RecoveryPolicy,

    /// Hand compressed payloads to the caller without decompressing.
    pub passthrough_compressed: bool,
}

impl QueueConfig {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Checks that sizes fit the on-disk format.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.path.is_empty(),
            InvalidConfigSnafu {
                reason: "queue path is empty",
            }
        );
        ensure!(
            self.num_slots > 0,
            InvalidConfigSnafu {
                reason: "a queue needs at least one slot",
            }
        );
        ensure!(
            self.num_slots <= (i32::MAX as usize - status_region_len(0)) / SLOT_SIZE,
            InvalidConfigSnafu {
                reason: format!("{} slots exceed the slot table limit", self.num_slots),
            }
        );
        ensure!(
            self.buf_size >= ENTRY_OVERHEAD,
            InvalidConfigSnafu {
                reason: format!(
                    "buffer of {} bytes cannot hold the {ENTRY_OVERHEAD} byte entry overhead",
                    self.buf_size
                ),
            }
        );
        ensure!(
            i32::try_from(self.buf_size).is_ok(),
            InvalidConfigSnafu {
                reason: format!("buffer of {} bytes exceeds the format limit", self.buf_size),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::new("/tmp/fmq/test");
        assert_eq!(config.mode, OpenMode::ReadWrite);
        assert_eq!(config.position, OpenPosition::End);
        assert_eq!(config.num_slots, 1000);
        assert_eq!(config.buf_size, 100_000);
        assert_eq!(config.open_poll_interval, Duration::from_secs(1));
        assert_eq!(config.recovery_policy, RecoveryPolicy::Reinitialize);
        assert!(config.poll_interval.is_none());
        assert!(!config.single_writer);
        config.validate().unwrap();
    }

    #[test_case(0, 1000; "no slots")]
    #[test_case(10, 8; "buffer below overhead")]
    #[test_case(10, i32::MAX as usize + 1; "buffer too large")]
    #[test_case(usize::MAX / 64, 1000; "slot table too large")]
    fn test_invalid_sizes(num_slots: usize, buf_size: usize) {
        let config = QueueConfig {
            num_slots,
            buf_size,
            ..QueueConfig::new("/tmp/q")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: QueueConfig = serde_json::from_str(
            r#"{
                "path": "/var/fmq/shmem_4100",
                "mode": "blocking_read_only",
                "position": "start",
                "compression_method": "zstd",
                "poll_interval": "25ms",
                "blocking_read_timeout": "2s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.mode, OpenMode::BlockingReadOnly);
        assert!(config.mode.is_blocking());
        assert!(!config.mode.is_writable());
        assert_eq!(config.position, OpenPosition::Start);
        assert_eq!(config.compression_method, CompressionMethod::Zstd);
        assert_eq!(config.poll_interval, Some(Duration::from_millis(25)));
        assert_eq!(config.blocking_read_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.num_slots, 1000);
    }
}
