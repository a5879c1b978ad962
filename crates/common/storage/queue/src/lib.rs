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

//! A persistent message queue shared between processes through memory-mapped
//! files or shared memory.
//!
//! One writer appends typed messages into a fixed ring of slots backed by a
//! circular data buffer, evicting the oldest messages when either fills up.
//! Any number of readers follow along independently, each with its own
//! cursor. See [`Queue`] for the handle and [`QueueBuilder`] to open one.

mod allocator;
pub mod builder;
mod checksum;
pub mod compression;
pub mod config;
pub mod device;
mod entry;
pub mod error;
pub mod inspect;
pub mod layout;
pub mod message;
pub mod queue;
pub mod reader;
pub mod recovery;
mod table;
mod writer;

pub use builder::QueueBuilder;
pub use compression::{CompressionMethod, compress, decompress};
pub use config::{OpenMode, OpenPosition, QueueConfig, RecoveryPolicy};
pub use device::{Geometry, remove_queue};
pub use error::{FmqError, Result};
pub use inspect::QueueReport;
pub use layout::StatusHeader;
pub use message::Message;
pub use queue::{Heartbeat, Queue, Usage};
pub use reader::{ReadCursor, SeekPosition};
pub use recovery::{RecoveryAction, RecoveryReport};
