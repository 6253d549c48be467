//! Compression detection for downloaded objects
//!
//! Objects are sniffed by content, not by key suffix or content type: a body
//! starting with the gzip magic bytes is inflated, anything else is passed
//! through untouched.

use flate2::read::MultiGzDecoder;
use std::borrow::Cow;
use std::io::Read;
use tracing::debug;

/// `1f 8b` header followed by the deflate compression method.
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Decompress gzip-compressed data, including concatenated members
pub fn decompress_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len().saturating_mul(4));
    decoder.read_to_end(&mut decompressed)?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed)
}

/// Returns the plain body, inflating it when it is gzip.
pub fn maybe_decompress(data: &[u8]) -> std::io::Result<Cow<'_, [u8]>> {
    if is_gzip(data) {
        decompress_gzip(data).map(Cow::Owned)
    } else {
        Ok(Cow::Borrowed(data))
    }
}
