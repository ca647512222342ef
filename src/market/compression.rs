//! Inflate support for compressed market frames.
//!
//! Feeds may push binary frames holding a zlib stream (RFC 1950). A few
//! gateways strip the zlib header and send raw deflate (RFC 1951), so
//! [`inflate`] falls back to that when the header is missing.
//!
//! Rust guideline compliant 2025-01

use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::io::Read;

use super::DecodeError;

/// Upper bound on an inflated frame; anything larger is treated as corrupt.
const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

/// Check for a zlib header: CM=8 (deflate) and a valid FCHECK.
#[must_use]
pub fn has_zlib_header(data: &[u8]) -> bool {
    match data {
        [cmf, flg, ..] => {
            cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0
        }
        _ => false,
    }
}

/// Inflate a compressed frame.
///
/// # Errors
///
/// Returns `DecodeError::Inflate` if the data is empty, corrupt, or
/// inflates past the size limit.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Inflate("empty payload".into()));
    }

    let mut decompressed = Vec::new();
    let read = if has_zlib_header(data) {
        ZlibDecoder::new(data)
            .take(MAX_INFLATED_LEN + 1)
            .read_to_end(&mut decompressed)
    } else {
        DeflateDecoder::new(data)
            .take(MAX_INFLATED_LEN + 1)
            .read_to_end(&mut decompressed)
    };

    read.map_err(|e| DecodeError::Inflate(format!("inflate failed: {e}")))?;

    if decompressed.len() as u64 > MAX_INFLATED_LEN {
        return Err(DecodeError::Inflate(format!(
            "inflated frame exceeds {MAX_INFLATED_LEN} bytes"
        )));
    }

    Ok(decompressed)
}
