// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! MiniDebugInfo (`.gnu_debugdata`) decompression.
//!
//! Stripped distribution binaries often carry an XZ-compressed ELF image in
//! their `.gnu_debugdata` section that contains nothing but a symbol table.
//! This module inflates that image so that the container reader can be
//! re-entered on the in-memory bytes.
//!
//! Decoding is driven through liblzma's streaming interface with explicit
//! bounds on both the cumulative output size and the number of iterations
//! that make no progress, so corrupt sections cannot make us balloon or spin.

use crate::debug;
use xz2::stream::{Action, Status, Stream};

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Output growth increment, as a factor of the compressed input size.
///
/// MiniDebugInfo sections compress symbol tables, which inflate well; 2x is
/// almost always enough on the first try.
const GROW_FACTOR: usize = 2;

/// Hard cap on the cumulative decompressed size.
const MAX_OUTPUT: usize = 512 << 20;

/// Number of consecutive zero-progress decoder iterations tolerated before
/// the stream is declared stuck.
const MAX_STALLS: u32 = 2;

/// Errors that can occur while inflating MiniDebugInfo.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decompressed MiniDebugInfo exceeds {} bytes", MAX_OUTPUT)]
    OutputTooLarge,

    #[error("XZ stream made no progress")]
    Stalled,

    #[error("XZ stream ended prematurely")]
    Truncated,

    #[error("XZ decoder: {0}")]
    Xz(#[from] xz2::stream::Error),
}

impl Error {
    /// Maps the error onto the errnum convention used by the error callback.
    ///
    /// Malformed input reports `EINVAL`; everything else (including decoder
    /// internals) reports `EIO`.
    pub fn errnum(&self) -> i32 {
        use xz2::stream::Error as Xz;

        match self {
            Error::Xz(Xz::Format | Xz::Options | Xz::Data) => libc::EINVAL,
            Error::Stalled | Error::Truncated | Error::OutputTooLarge => libc::EINVAL,
            Error::Xz(_) => libc::EIO,
        }
    }
}

/// Inflates an XZ stream from a `.gnu_debugdata` section.
///
/// Accepts streams with integrity check NONE, CRC-32 or CRC-64 (liblzma
/// verifies whichever is present) and the optional BCJ prefilters.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut stream = Stream::new_stream_decoder(u64::MAX, 0)?;

    let step = compressed
        .len()
        .saturating_mul(GROW_FACTOR)
        .clamp(4096, MAX_OUTPUT);

    let mut out = vec![0u8; step];
    let mut filled = 0usize;
    let mut stalls = 0u32;

    loop {
        let in_before = stream.total_in() as usize;
        let out_before = stream.total_out() as usize;

        // The entire input is available up front, so liblzma may be told
        // right away that no more bytes will follow.
        let status = stream.process(&compressed[in_before..], &mut out[filled..], Action::Finish)?;

        let consumed = stream.total_in() as usize - in_before;
        let produced = stream.total_out() as usize - out_before;
        filled += produced;

        match status {
            Status::StreamEnd => {
                out.truncate(filled);
                debug!(
                    "MiniDebugInfo: inflated {} -> {} bytes",
                    compressed.len(),
                    filled
                );
                return Ok(out);
            }

            // Decoder wants to report the integrity-check type; keep going.
            Status::GetCheck => continue,

            Status::Ok | Status::MemNeeded => {}
        }

        if consumed == 0 && produced == 0 {
            stalls += 1;
            if stalls >= MAX_STALLS {
                // All input consumed but no end-of-stream marker seen.
                if in_before == compressed.len() {
                    return Err(Error::Truncated);
                }
                return Err(Error::Stalled);
            }
        } else {
            stalls = 0;
        }

        if filled == out.len() {
            if out.len() >= MAX_OUTPUT {
                return Err(Error::OutputTooLarge);
            }
            let new_len = out.len().saturating_add(step).min(MAX_OUTPUT);
            out.resize(new_len, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xz2::stream::{Check, Filters, LzmaOptions};

    fn xz_compress(data: &[u8], check: Check) -> Vec<u8> {
        let mut stream = Stream::new_easy_encoder(6, check).unwrap();
        encode_with(&mut stream, data)
    }

    fn encode_with(stream: &mut Stream, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);

        loop {
            let consumed = stream.total_in() as usize;
            let status = stream
                .process_vec(&data[consumed..], &mut out, Action::Finish)
                .unwrap();

            if status == Status::StreamEnd {
                return out;
            }

            out.reserve(4096);
        }
    }

    fn sample_payload() -> Vec<u8> {
        // Repetitive data, like the symbol tables this code inflates in
        // practice.
        let mut data = Vec::new();
        for i in 0u32..20_000 {
            data.extend_from_slice(&(i % 251).to_le_bytes());
        }
        data
    }

    #[test]
    fn roundtrip_crc32() {
        let payload = sample_payload();
        let packed = xz_compress(&payload, Check::Crc32);
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn roundtrip_crc64() {
        let payload = sample_payload();
        let packed = xz_compress(&payload, Check::Crc64);
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn roundtrip_no_check() {
        let payload = sample_payload();
        let packed = xz_compress(&payload, Check::None);
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn roundtrip_x86_bcj() {
        let payload = sample_payload();

        let mut filters = Filters::new();
        filters.x86();
        filters.lzma2(&LzmaOptions::new_preset(6).unwrap());

        let mut stream = Stream::new_stream_encoder(&filters, Check::Crc64).unwrap();
        let packed = encode_with(&mut stream, &payload);

        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn output_grows_past_first_buffer() {
        // High-ratio input: make sure the grow loop runs at least once.
        let payload = vec![0u8; 4 << 20];
        let packed = xz_compress(&payload, Check::Crc32);
        assert!(packed.len() * GROW_FACTOR < payload.len());
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn truncated_stream_errors_out() {
        let payload = sample_payload();
        let packed = xz_compress(&payload, Check::Crc32);

        // Chop the stream short: decoding must terminate with an error
        // rather than spinning on the missing tail.
        let result = decompress(&packed[..packed.len() / 2]);
        assert!(result.is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let result = decompress(b"this is not an xz stream at all");
        assert!(matches!(result, Err(Error::Xz(_))));
    }
}
