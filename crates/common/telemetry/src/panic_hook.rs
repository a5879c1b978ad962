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

//! Panic hook that routes panics through `tracing` with a backtrace.

use std::{panic, thread};

use backtrace::Backtrace;

/// Replaces the panic handler with one that logs the panic, its location,
/// the panicking thread and a backtrace before running the default hook.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic| {
        let backtrace = format!("{:?}", Backtrace::new());
        let thread = thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                thread = thread_name,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic, thread = thread_name, backtrace = %backtrace);
        }
        default_hook(panic);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_keeps_panics_catchable() {
        set_panic_hook();
        let result = panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
        let _ = panic::take_hook();
    }
}
