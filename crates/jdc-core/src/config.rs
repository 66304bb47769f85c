//! Engine configuration.
//!
//! A single validated [`Config`] drives both roles; the CLI populates it from
//! flags and the engine never re-reads the environment. Validation failures
//! short-circuit startup before any socket or file is touched.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Practical ceiling for the chunk size. Chunk buffers are single `Vec<u8>`
/// allocations, so sizes beyond a signed 32-bit length are rejected rather
/// than risking pathological allocations.
pub const MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024 * 1024 - 1;

/// Configuration for a transfer session (either role).
#[derive(Debug, Clone)]
pub struct Config {
    /// Receiver role when true, sender role when false
    pub is_server: bool,
    /// Address to listen on (server mode)
    pub listen_address: String,
    /// Directory for received files (server mode)
    pub output_dir: PathBuf,
    /// Server address to connect to (client mode)
    pub server_address: String,
    /// File to transfer (client mode)
    pub file_path: PathBuf,
    /// Bytes per chunk
    pub chunk_size: u64,
    /// Buffered reader/writer capacity in bytes
    pub buffer_size: usize,
    /// Scheduler parallelism hint
    pub workers: usize,
    /// Enable the per-file compression policy
    pub compression: bool,
    /// This side's opt-in to end-to-end hash verification
    pub verify_hash: bool,
    /// Render progress while transferring
    pub show_progress: bool,
    /// Per-operation deadline
    pub timeout: Duration,
    /// Maximum attempts per chunk
    pub retries: u32,
    /// Base delay applied before each chunk
    pub chunk_delay: Duration,
    /// Scale the chunk delay with observed throughput
    pub adaptive_delay: bool,
    /// Lower bound for the adaptive delay
    pub min_delay: Duration,
    /// Upper bound for the adaptive delay
    pub max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_server: false,
            listen_address: "0.0.0.0:8000".to_string(),
            output_dir: PathBuf::from("./output"),
            server_address: "localhost:8000".to_string(),
            file_path: PathBuf::new(),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            workers: default_workers(),
            compression: false,
            verify_hash: true,
            show_progress: true,
            timeout: crate::DEFAULT_TIMEOUT,
            retries: crate::DEFAULT_RETRIES,
            chunk_delay: crate::DEFAULT_CHUNK_DELAY,
            adaptive_delay: false,
            min_delay: crate::DEFAULT_MIN_DELAY,
            max_delay: crate::DEFAULT_MAX_DELAY,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| (n.get() / 2).max(1))
}

impl Config {
    /// Check that the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::validation("chunk_size", "must be positive"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::validation(
                "chunk_size",
                format!("must not exceed {MAX_CHUNK_SIZE} bytes"),
            ));
        }
        if self.buffer_size == 0 {
            return Err(Error::validation("buffer_size", "must be positive"));
        }
        if self.workers == 0 {
            return Err(Error::validation("workers", "must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::validation("timeout", "must be positive"));
        }
        if self.adaptive_delay {
            if self.min_delay.is_zero() || self.max_delay.is_zero() {
                return Err(Error::validation(
                    "adaptive_delay",
                    "min and max delay must be positive",
                ));
            }
            if self.min_delay > self.max_delay {
                return Err(Error::validation(
                    "adaptive_delay",
                    "min delay exceeds max delay",
                ));
            }
        }
        if !self.is_server {
            if self.file_path.as_os_str().is_empty() {
                return Err(Error::validation(
                    "file_path",
                    "a source file is required in client mode",
                ));
            }
            if !self.file_path.is_file() {
                return Err(Error::validation("file_path", "source file does not exist"));
            }
        }
        Ok(())
    }
}
