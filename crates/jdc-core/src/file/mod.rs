//! Chunk grid math and positional file I/O.
//!
//! A transfer partitions the file into fixed-size chunks; every read and
//! write is addressed by an absolute byte offset derived from the chunk
//! index. The file cursor is repositioned explicitly on every operation, so
//! no code path depends on the handle's current position.

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// The fixed chunk partition of a file.
///
/// Chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size,
/// file_size))`; only the final chunk may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    /// Total file size in bytes
    pub file_size: u64,
    /// Bytes per chunk
    pub chunk_size: u64,
    /// Number of chunks, `ceil(file_size / chunk_size)`
    pub num_chunks: u64,
}

impl ChunkGrid {
    /// Build the grid for a file of `file_size` bytes.
    #[must_use]
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            file_size,
            chunk_size,
            num_chunks: file_size.div_ceil(chunk_size),
        }
    }

    /// Absolute byte offset of chunk `index`.
    #[must_use]
    pub fn offset(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Size in bytes of chunk `index`.
    #[must_use]
    pub fn len(&self, index: u64) -> u64 {
        let start = self.offset(index);
        self.file_size.saturating_sub(start).min(self.chunk_size)
    }

    /// Chunk size expected for the chunk starting at `offset`.
    #[must_use]
    pub fn len_at(&self, offset: u64) -> u64 {
        self.file_size.saturating_sub(offset).min(self.chunk_size)
    }
}

/// Read up to `buf.len()` bytes at an absolute offset.
///
/// Returns the number of bytes read; a short count is valid only at EOF
/// (the final chunk).
///
/// # Errors
///
/// Returns a filesystem error if the seek or read fails.
pub async fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::filesystem("seek_read", e))?;

    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::filesystem("read_chunk", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write a full buffer at an absolute offset.
///
/// # Errors
///
/// Returns a filesystem error if the seek or write fails.
pub async fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::filesystem("seek_write", e))?;
    file.write_all(data)
        .await
        .map_err(|e| Error::filesystem("write_chunk", e))
}

/// Extend a freshly created output file to its final size.
///
/// Failures here are reported but non-fatal to the transfer; positional
/// writes fill the file either way.
///
/// # Errors
///
/// Returns a filesystem error if the length cannot be set.
pub async fn preallocate(file: &File, size: u64) -> Result<()> {
    file.set_len(size)
        .await
        .map_err(|e| Error::filesystem("preallocate", e))
}

/// Reduce a received filename to a safe basename.
///
/// Any directory components are stripped; names that resolve to no file
/// component (empty, `.`, `..`, trailing separator) are rejected.
///
/// # Errors
///
/// Returns a validation error if no usable basename remains.
pub fn sanitize_basename(filename: &str) -> Result<String> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::validation("filename", "no usable file name component"))?;

    if name == ".." || name.is_empty() {
        return Err(Error::validation("filename", "no usable file name component"));
    }

    Ok(name.to_string())
}

/// Metadata of the transfer source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Basename announced to the receiver
    pub name: String,
    /// File size in bytes
    pub size: u64,
}

/// Stat the source file for a transfer.
///
/// # Errors
///
/// Returns a validation error for directories and a filesystem error if the
/// file cannot be stat'ed.
pub async fn source_info(path: &Path) -> Result<SourceInfo> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::filesystem("stat", e))?;

    if metadata.is_dir() {
        return Err(Error::validation(
            "file_path",
            "cannot transfer directories",
        ));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::validation("file_path", "no usable file name component"))?
        .to_string();

    Ok(SourceInfo {
        name,
        size: metadata.len(),
    })
}

/// Format a byte count for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
