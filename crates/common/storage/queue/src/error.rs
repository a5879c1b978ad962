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

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

/// Queue operation errors.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum FmqError {
    /// The mapping layer failed to open, map, read or write a region.
    #[snafu(display("Device error on {path}: {message}"))]
    Device {
        path:    String,
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    /// Filesystem I/O failure outside the mapping layer.
    #[snafu(display("IO error on {}", path.display()))]
    Io {
        path:   PathBuf,
        #[snafu(source)]
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A read-only open targeted a queue that does not exist.
    #[snafu(display("Queue does not exist: {path}"))]
    NotFound {
        path: String,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    /// A mutation was attempted through a read-only mapping.
    #[snafu(display("Queue is open read-only: {path}"))]
    ReadOnly {
        path: String,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    /// Checksum, magic cookie or marker mismatch.
    #[snafu(display("Corrupted {what} in {path}: {reason}"))]
    Corruption {
        path:   String,
        what:   String,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The message does not fit even in an empty buffer.
    #[snafu(display(
        "Message needs {stored_len} bytes, larger than the {buf_size} byte buffer"
    ))]
    FullQueue {
        stored_len: usize,
        buf_size:   usize,
        #[snafu(implicit)]
        loc:        snafu::Location,
    },

    /// A blocking operation ran past its timeout.
    #[snafu(display("Timed out after {waited:?} waiting on {path}"))]
    Timeout {
        path:   String,
        waited: Duration,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The writer lock could not be acquired in time.
    #[snafu(display("Unable to acquire writer lock on {path} within {waited:?}"))]
    Lock {
        path:   String,
        waited: Duration,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Compression error: {message}"))]
    Compression {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig {
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Message id {id} is not in queue {path}"))]
    IdNotFound {
        path: String,
        id:   i32,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },
}

impl FmqError {
    /// True for errors a caller may retry: timeouts and lock contention.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Lock { .. })
    }

    #[must_use]
    pub const fn is_corruption(&self) -> bool { matches!(self, Self::Corruption { .. }) }

    #[must_use]
    pub const fn is_timeout(&self) -> bool { matches!(self, Self::Timeout { .. }) }

    /// True for failures of the underlying storage.
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(
            self,
            Self::Device { .. } | Self::Io { .. } | Self::NotFound { .. } | Self::ReadOnly { .. }
        )
    }
}

/// Result type for queue operations.
pub type Result<T, E = FmqError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let timeout = TimeoutSnafu {
            path:   "q",
            waited: Duration::from_millis(5),
        }
        .build();
        assert!(timeout.is_recoverable());
        assert!(timeout.is_timeout());

        let lock = LockSnafu {
            path:   "q",
            waited: Duration::from_secs(1),
        }
        .build();
        assert!(lock.is_recoverable());

        let corrupt = CorruptionSnafu {
            path:   "q",
            what:   "status header",
            reason: "bad checksum",
        }
        .build();
        assert!(!corrupt.is_recoverable());
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_device());
    }

    #[test]
    fn test_display_names_the_queue() {
        let err = NotFoundSnafu { path: "/tmp/q" }.build();
        assert!(err.is_device());
        assert_eq!(err.to_string(), "Queue does not exist: /tmp/q");
    }
}
