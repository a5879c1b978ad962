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

use std::{sync::Arc, time::Duration};

use crate::{
    CompressionMethod, Queue, QueueConfig, Result,
    config::{OpenMode, OpenPosition, RecoveryPolicy},
    queue::Heartbeat,
};

/// Fluent construction of a [`Queue`] handle.
pub struct QueueBuilder {
    config:    QueueConfig,
    heartbeat: Option<Heartbeat>,
}

impl QueueBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            config:    QueueConfig::new(path),
            heartbeat: None,
        }
    }

    /// Starts from a loaded configuration.
    #[must_use]
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            heartbeat: None,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    #[must_use]
    pub fn position(mut self, position: OpenPosition) -> Self {
        self.config.position = position;
        self
    }

    #[must_use]
    pub fn num_slots(mut self, num_slots: usize) -> Self {
        self.config.num_slots = num_slots;
        self
    }

    #[must_use]
    pub fn buf_size(mut self, buf_size: usize) -> Self {
        self.config.buf_size = buf_size;
        self
    }

    #[must_use]
    pub fn compress(mut self, method: CompressionMethod) -> Self {
        self.config.compress = true;
        self.config.compression_method = method;
        self
    }

    #[must_use]
    pub fn passthrough_compressed(mut self, passthrough: bool) -> Self {
        self.config.passthrough_compressed = passthrough;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn open_poll_interval(mut self, interval: Duration) -> Self {
        self.config.open_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn blocking_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.blocking_read_timeout = Some(timeout);
        self
    }

    /// Makes writes wait for the reader instead of overwriting unread
    /// messages, for at most `timeout` when set.
    #[must_use]
    pub fn blocking_write(mut self, timeout: Option<Duration>) -> Self {
        self.config.blocking_write = true;
        self.config.blocking_write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    /// Skips the device lock. Only safe with exactly one writer.
    #[must_use]
    pub fn single_writer(mut self, single_writer: bool) -> Self {
        self.config.single_writer = single_writer;
        self
    }

    #[must_use]
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.config.recovery_policy = policy;
        self
    }

    /// Called with a short label on every poll of a blocking operation.
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.heartbeat = Some(Arc::new(heartbeat));
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::open(self.config, self.heartbeat) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default_config() {
        let builder = QueueBuilder::new("/tmp/fmq/test");
        assert_eq!(builder.config.path, "/tmp/fmq/test");
        assert_eq!(builder.config.num_slots, 1000);
        assert_eq!(builder.config.buf_size, 100_000);
        assert!(!builder.config.blocking_write);
        assert!(builder.heartbeat.is_none());
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = QueueBuilder::new("/tmp/fmq/test")
            .mode(OpenMode::BlockingReadOnly)
            .position(OpenPosition::Start)
            .num_slots(64)
            .buf_size(1 << 20)
            .compress(CompressionMethod::Zstd)
            .blocking_write(Some(Duration::from_secs(2)))
            .recovery_policy(RecoveryPolicy::Recover)
            .heartbeat(|_| {});

        assert_eq!(builder.config.mode, OpenMode::BlockingReadOnly);
        assert_eq!(builder.config.position, OpenPosition::Start);
        assert_eq!(builder.config.num_slots, 64);
        assert!(builder.config.compress);
        assert_eq!(builder.config.compression_method, CompressionMethod::Zstd);
        assert_eq!(
            builder.config.blocking_write_timeout,
            Some(Duration::from_secs(2))
        );
        assert_eq!(builder.config.recovery_policy, RecoveryPolicy::Recover);
        assert!(builder.heartbeat.is_some());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = QueueBuilder::new("/tmp/fmq/never").num_slots(0).build().unwrap_err();
        assert!(matches!(err, crate::FmqError::InvalidConfig { .. }));
    }
}
