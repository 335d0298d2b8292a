//! (De)compression of cached response bodies.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses some data with gzip at the best compression level.
///
/// # Arguments
///
/// * `data`: Uncompressed data
pub fn compress(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.into())
}

/// Decompresses gzip data and returns the uncompressed data.
///
/// # Arguments
///
/// * `data`: Compressed data
pub fn decompress(data: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut buf = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut buf)?;
    Ok(buf.into())
}

/// Whether the data looks like an uncompressed JSON object.
///
/// Entries written before compression was introduced are stored as plain JSON.
pub fn looks_like_json(data: &[u8]) -> bool {
    let first = data.iter().find(|b| !b.is_ascii_whitespace());
    let last = data.iter().rev().find(|b| !b.is_ascii_whitespace());
    matches!(first, Some(b'{')) && matches!(last, Some(b'}'))
}
