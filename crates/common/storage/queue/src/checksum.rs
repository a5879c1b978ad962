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

//! Additive checksums for the status header and slot records.
//!
//! Each record ends with an `i32` word holding the wrapping sum of the
//! preceding fields, with selected fields bitwise complemented. Changing any
//! single field by a non-zero amount changes the sum, so a flipped byte in a
//! record is always caught.

/// Complement mask for the header fields that precede the checksum word.
const HEADER_COMPLEMENT: [bool; 13] = [
    false, // magic_cookie
    true,  // youngest_id
    false, // youngest_slot
    true,  // oldest_slot
    false, // nslots
    false, // buf_size
    true,  // begin_insert
    false, // end_insert
    true,  // begin_append
    false, // append_mode
    false, // time_written
    true,  // blocking_write
    false, // last_id_read
];

/// Complement mask for the slot fields that precede the checksum word.
const SLOT_COMPLEMENT: [bool; 9] = [
    false, // active
    true,  // id
    false, // time
    true,  // msg_len
    false, // stored_len
    false, // offset
    true,  // type
    false, // subtype
    true,  // compress
];

#[inline]
fn sum_words(words: &[i32], complement: &[bool]) -> i32 {
    words
        .iter()
        .zip(complement)
        .fold(0i32, |sum, (&word, &flip)| {
            sum.wrapping_add(if flip { !word } else { word })
        })
}

/// Checksum over the 13 header words that precede the checksum field.
#[inline]
pub(crate) fn header_checksum(words: &[i32]) -> i32 { sum_words(words, &HEADER_COMPLEMENT) }

/// Checksum over the 9 slot words that precede the checksum field.
#[inline]
pub(crate) fn slot_checksum(words: &[i32]) -> i32 { sum_words(words, &SLOT_COMPLEMENT) }
