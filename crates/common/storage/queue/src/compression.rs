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

//! Payload compression.
//!
//! Compressed payloads are wrapped in a 12-byte envelope so that readers can
//! pick the decoder without knowing how the writer was configured:
//!
//! ```text
//! ┌──────────────┬────────────────────────┬──────────────────────┬───────────┐
//! │ Tag (4B)     │ Uncompressed len (4B)  │ Compressed len (4B)  │ Data      │
//! │ FQGZ / FQZS  │ big-endian u32         │ big-endian u32       │           │
//! └──────────────┴────────────────────────┴──────────────────────┴───────────┘
//! ```

use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ensure};

use crate::{Result, error::CompressionSnafu};

const GZIP_TAG: [u8; 4] = *b"FQGZ";
const ZSTD_TAG: [u8; 4] = *b"FQZS";
const ZSTD_LEVEL: i32 = 3;

/// Length of the envelope header preceding the compressed data.
pub const ENVELOPE_HEADER_LEN: usize = 12;

/// Upper bound on the output buffer reserved from an envelope's length word.
const PREALLOC_LIMIT: usize = 1 << 20;

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    #[default]
    Gzip,
    Zstd,
}

impl CompressionMethod {
    const fn tag(self) -> [u8; 4] {
        match self {
            Self::Gzip => GZIP_TAG,
            Self::Zstd => ZSTD_TAG,
        }
    }

    fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match tag {
            GZIP_TAG => Some(Self::Gzip),
            ZSTD_TAG => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub method:           CompressionMethod,
    pub uncompressed_len: usize,
    pub compressed_len:   usize,
}

impl Envelope {
    /// Parses the envelope at the start of `bytes`, checking that the
    /// announced data is present.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= ENVELOPE_HEADER_LEN,
            CompressionSnafu {
                message: format!("{} bytes is too short for an envelope", bytes.len()),
            }
        );
        let word = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize
        };
        let method = CompressionMethod::from_tag([bytes[0], bytes[1], bytes[2], bytes[3]])
            .context(CompressionSnafu {
                message: "unknown compression tag",
            })?;
        let envelope = Self {
            method,
            uncompressed_len: word(4),
            compressed_len: word(8),
        };
        ensure!(
            envelope.total_len() <= bytes.len(),
            CompressionSnafu {
                message: format!(
                    "envelope announces {} bytes, only {} present",
                    envelope.compressed_len,
                    bytes.len() - ENVELOPE_HEADER_LEN
                ),
            }
        );
        Ok(envelope)
    }

    #[must_use]
    pub const fn total_len(&self) -> usize { ENVELOPE_HEADER_LEN + self.compressed_len }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).ok().context(CompressionSnafu {
        message: format!("{len} bytes exceeds the envelope size limit"),
    })
}

/// Compresses `data` into an envelope.
pub fn compress(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    let compressed = match method {
        CompressionMethod::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| CompressionSnafu { message: e.to_string() }.build())?
        }
        CompressionMethod::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| CompressionSnafu { message: e.to_string() }.build())?,
    };

    let mut envelope = Vec::with_capacity(ENVELOPE_HEADER_LEN + compressed.len());
    envelope.extend_from_slice(&method.tag());
    envelope.extend_from_slice(&len_u32(data.len())?.to_be_bytes());
    envelope.extend_from_slice(&len_u32(compressed.len())?.to_be_bytes());
    envelope.extend_from_slice(&compressed);
    Ok(envelope)
}

/// Decompresses an envelope, checking the result against the announced
/// uncompressed length.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let envelope = Envelope::parse(bytes)?;
    let data = &bytes[ENVELOPE_HEADER_LEN..envelope.total_len()];
    // One byte past the announced length exposes oversized output.
    let limit = envelope.uncompressed_len as u64 + 1;

    let mut out = Vec::with_capacity(envelope.uncompressed_len.min(PREALLOC_LIMIT));
    match envelope.method {
        CompressionMethod::Gzip => GzDecoder::new(data).take(limit).read_to_end(&mut out),
        CompressionMethod::Zstd => {
            zstd::stream::Decoder::new(data).and_then(|d| d.take(limit).read_to_end(&mut out))
        }
    }
    .map_err(|e| CompressionSnafu { message: e.to_string() }.build())?;

    ensure!(
        out.len() == envelope.uncompressed_len,
        CompressionSnafu {
            message: format!(
                "decompressed {} bytes, envelope announced {}",
                out.len(),
                envelope.uncompressed_len
            ),
        }
    );
    Ok(out)
}
