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

//! Version strings baked in at compile time.

use shadow_rs::{formatcp, shadow};

shadow!(build);

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// Release pipelines set `FMQ_RELEASE`; anything else is a development build.
const RELEASE: bool = option_env!("FMQ_RELEASE").is_some();

const COMMIT: &str = if build::GIT_CLEAN {
    build::SHORT_COMMIT
} else {
    formatcp!("{}-dirty", build::SHORT_COMMIT)
};

/// `0.1.0` for releases, `0.1.0-dev+abc1234` otherwise.
#[allow(clippy::const_is_empty)]
pub const VERSION: &str = if RELEASE || build::SHORT_COMMIT.is_empty() {
    build::PKG_VERSION
} else {
    formatcp!("{}-dev+{}", build::PKG_VERSION, COMMIT)
};

/// Shown by `fmq --version`.
pub const LONG_VERSION: &str = formatcp!(
    "{}\nbranch: {}\ncommit: {}\nbuilt:  {}\nrustc:  {}",
    VERSION,
    build::BRANCH,
    build::COMMIT_HASH,
    build::BUILD_TIME,
    build::RUST_VERSION,
);
