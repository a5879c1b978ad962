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

//! Advisory writer lock shared by all processes attached to a queue.

use std::{
    fs::{File, OpenOptions, TryLockError},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use snafu::ResultExt;
use tracing::debug;

use crate::{
    Result,
    error::{IoSnafu, LockSnafu},
};

const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Exclusive `flock`-style lock on the status region file.
///
/// Each handle opens its own file description, so two handles inside one
/// process exclude each other just like two processes do.
pub(crate) struct WriterLock {
    file: File,
    path: PathBuf,
    held: bool,
}

impl WriterLock {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .context(IoSnafu { path })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            held: false,
        })
    }

    /// Blocks until the lock is held, or fails with a lock error once
    /// `timeout` has elapsed.
    pub(crate) fn acquire(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.held {
            return Ok(());
        }

        let Some(limit) = timeout else {
            self.file.lock().context(IoSnafu { path: &self.path })?;
            self.held = true;
            return Ok(());
        };

        let start = Instant::now();
        let mut backoff = MIN_BACKOFF;
        loop {
            match self.file.try_lock() {
                Ok(()) => {
                    self.held = true;
                    return Ok(());
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(source)) => {
                    return Err(source).context(IoSnafu { path: &self.path });
                }
            }

            let waited = start.elapsed();
            if waited >= limit {
                debug!(path = %self.path.display(), ?waited, "Writer lock contended");
                return LockSnafu {
                    path: self.path.display().to_string(),
                    waited,
                }
                .fail();
            }
            thread::sleep(backoff.min(limit - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.file.unlock().context(IoSnafu { path: &self.path })?;
        self.held = false;
        Ok(())
    }

    pub(crate) const fn is_held(&self) -> bool { self.held }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_file() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("q.stat");
        std::fs::write(&path, b"status").unwrap();
        (temp_dir, path)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_dir, path) = lock_file();
        let mut lock = WriterLock::open(&path).unwrap();

        lock.acquire(None).unwrap();
        assert!(lock.is_held());
        // Re-acquiring a held lock is a no-op.
        lock.acquire(None).unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let (_dir, path) = lock_file();
        let mut owner = WriterLock::open(&path).unwrap();
        let mut other = WriterLock::open(&path).unwrap();

        owner.acquire(None).unwrap();
        let start = Instant::now();
        let err = other
            .acquire(Some(Duration::from_millis(60)))
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(start.elapsed() >= Duration::from_millis(60));

        owner.release().unwrap();
        other.acquire(Some(Duration::from_millis(60))).unwrap();
        assert!(other.is_held());
    }
}
