//! # JustDataCopier Core Library
//!
//! `jdc-core` implements the transfer engine behind `jdc`, a point-to-point
//! network copier for large files (megabytes to terabytes).
//!
//! A sender pushes exactly one file to a receiver over one persistent TCP
//! connection. The receiver drives the conversation: it requests chunks by
//! absolute byte offset, in strictly ascending order, with a single request
//! outstanding at any time. Received chunks are written positionally and
//! recorded in a durable state file so an interrupted transfer resumes
//! without re-sending completed chunks.
//!
//! ## Modules
//!
//! - [`client`] - Sender session: handshake, resume negotiation, request loop
//! - [`compression`] - Per-chunk gzip codec and the extension-based policy
//! - [`config`] - Engine configuration and validation
//! - [`error`] - Unified error type
//! - [`mod@file`] - Chunk grid math and positional file I/O
//! - [`hash`] - Size-selected streaming digests (md5 / sha256 / blake2b)
//! - [`net`] - Socket tuning, adaptive pacing, RTT profiling
//! - [`progress`] - Transfer progress snapshots
//! - [`protocol`] - Wire protocol codec
//! - [`server`] - Receiver: listener and per-transfer state machine
//! - [`state`] - Resumable transfer state persistence

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::doc_markdown)]

pub mod client;
pub mod compression;
pub mod config;
pub mod error;
pub mod file;
pub mod hash;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod state;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chunk size (2 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Default stream buffer size (512 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Default per-operation timeout
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Default number of retry attempts per chunk
pub const DEFAULT_RETRIES: u32 = 5;

/// Default base delay between chunk transfers
pub const DEFAULT_CHUNK_DELAY: std::time::Duration = std::time::Duration::from_millis(10);

/// Default lower bound for the adaptive delay
pub const DEFAULT_MIN_DELAY: std::time::Duration = std::time::Duration::from_millis(1);

/// Default upper bound for the adaptive delay
pub const DEFAULT_MAX_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// TCP send/receive buffer size applied after connect (1 MiB)
pub const TCP_BUFFER_SIZE: usize = 1024 * 1024;
