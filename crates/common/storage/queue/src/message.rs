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

//! Messages returned to readers.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Writer-assigned id, increasing by one per write and wrapping at
    /// [`MAX_ID`](crate::layout::MAX_ID).
    pub id:               i32,
    /// Slot that held the message when it was read.
    pub slot:             usize,
    /// Caller-defined type.
    pub msg_type:         i32,
    /// Caller-defined subtype.
    pub subtype:          i32,
    /// Second-resolution write time.
    pub time:             DateTime<Utc>,
    /// Payload bytes. Still enveloped when `compressed` is set.
    pub payload:          Bytes,
    /// The payload is a compressed envelope, only returned by handles that
    /// pass compressed data through.
    pub compressed:       bool,
    /// Payload length after decompression.
    pub uncompressed_len: usize,
}

impl Message {
    #[must_use]
    pub fn len(&self) -> usize { self.payload.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.payload.is_empty() }
}
