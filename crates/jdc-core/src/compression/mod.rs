//! Per-chunk gzip compression and the extension-based policy.
//!
//! Compression is decided once per file, from the extension alone: known
//! text-like formats compress, formats that already carry their own
//! compression never do, and unknown extensions default to uncompressed.
//! Each chunk is a self-contained gzip stream, so chunks stay independently
//! retryable and resumable.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Extensions worth compressing (text-like formats).
pub const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "txt", "log", "csv", "json", "xml", "html", "htm", "css", "js", "sql", "md", "yaml", "yml",
    "ini", "conf", "cfg",
];

/// Extensions that already carry compression and are sent raw.
pub const ALREADY_COMPRESSED_EXTENSIONS: &[&str] = &[
    "zip", "gz", "bz2", "xz", "rar", "7z", "tar", "mp3", "mp4", "avi", "mkv", "jpg", "jpeg",
    "png", "gif", "webp", "pdf", "docx", "xlsx", "pptx", "odt", "ods", "odp",
];

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Decide whether chunks of this file should be compressed.
///
/// Unknown extensions (and files without one) default to uncompressed.
#[must_use]
pub fn should_compress(filename: &str) -> bool {
    match extension_of(filename) {
        Some(ext) => {
            !ALREADY_COMPRESSED_EXTENSIONS.contains(&ext.as_str())
                && COMPRESSIBLE_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Compression level for a file: the default level for known text formats,
/// best-speed otherwise.
#[must_use]
pub fn level_for(filename: &str) -> Compression {
    match extension_of(filename) {
        Some(ext) if COMPRESSIBLE_EXTENSIONS.contains(&ext.as_str()) => Compression::default(),
        _ => Compression::fast(),
    }
}

/// Compress one chunk as a gzip stream.
///
/// # Errors
///
/// Returns a compression error if the encoder fails.
pub fn compress(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
    encoder
        .write_all(data)
        .map_err(|e| Error::compression("deflate", e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::compression("deflate", e.to_string()))
}

/// Decompress one chunk, requiring the output to be exactly `expected_len`
/// bytes. A mismatch rejects the chunk so the retry envelope re-requests it.
///
/// # Errors
///
/// Returns a compression error if the stream is invalid or the decompressed
/// size differs from the advertised chunk size.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::compression("inflate", e.to_string()))?;

    if out.len() != expected_len {
        return Err(Error::compression(
            "inflate",
            format!("decompressed {} bytes, expected {expected_len}", out.len()),
        ));
    }
    Ok(out)
}
