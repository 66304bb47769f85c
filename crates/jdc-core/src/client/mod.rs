//! The sender: connects, announces the file, and services the receiver's
//! requests until `Complete`.
//!
//! The client is reactive. After `Init` it consumes exactly one command to
//! settle resume negotiation (the server's first `Request` may arrive in the
//! same breath as the `Resume` frame, so a non-`Resume` first command is
//! carried into the main loop rather than lost), then dispatches on whatever
//! the server asks for: chunk data, a digest, or completion.

use std::time::Duration;

use flate2::Compression;
use tokio::fs::File;
use tokio::io::{AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{self, ChunkGrid, SourceInfo};
use crate::hash::{self, HashAlgorithm};
use crate::net::{self, profile_network, RateController};
use crate::progress::{ProgressTracker, TransferPhase, TransferProgress};
use crate::protocol::{self, timed, Command};

/// Deadline floor for the hash verdict; the receiver re-hashes the whole
/// file from disk before answering.
const HASH_VERIFY_TIMEOUT: Duration = Duration::from_secs(300);

/// A sender session for one file.
pub struct SendSession {
    config: Config,
    source: SourceInfo,
    grid: ChunkGrid,
    tracker: ProgressTracker,
    compress_chunks: bool,
    compression_level: Compression,
}

impl SendSession {
    /// Validate the configuration and stat the source file.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad configuration or missing source.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let source = file::source_info(&config.file_path).await?;
        if source.size == 0 {
            return Err(Error::validation("file_path", "source file is empty"));
        }

        let grid = ChunkGrid::new(source.size, config.chunk_size);
        let tracker = ProgressTracker::new(&source.name, source.size, grid.num_chunks);

        let compress_chunks = config.compression && crate::compression::should_compress(&source.name);
        let compression_level = crate::compression::level_for(&source.name);

        Ok(Self {
            config,
            source,
            grid,
            tracker,
            compress_chunks,
            compression_level,
        })
    }

    /// Subscribe to progress snapshots.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.tracker.subscribe()
    }

    /// Run the transfer to completion.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; `Error::Cancelled` when the shutdown
    /// token fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            server = %self.config.server_address,
            file = %self.source.name,
            size = %file::format_size(self.source.size),
            chunks = self.grid.num_chunks,
            compression = self.compress_chunks,
            "Starting transfer"
        );

        let mut source_file = File::open(&self.config.file_path)
            .await
            .map_err(|e| Error::filesystem("open_source", e))?;

        let stream = TcpStream::connect(&self.config.server_address)
            .await
            .map_err(|e| Error::network("connect", e))?;
        if let Err(e) = net::configure_stream(&stream) {
            tracing::warn!(error = %e, "Failed to tune TCP connection");
        }

        // Best-effort RTT probe on a second connection. The chunk-size
        // recommendation is advisory (the grid is fixed for the transfer);
        // only stream buffering is retuned from it.
        let profile = profile_network(&self.config.server_address).await;
        tracing::info!(
            rtt = ?profile.rtt,
            bandwidth = %file::format_size(profile.bandwidth),
            recommended_chunk = %file::format_size(profile.optimal_chunk_size),
            "Network profile"
        );
        let buffer_size = self
            .config
            .buffer_size
            .max(usize::try_from(profile.optimal_chunk_size / 4).unwrap_or(self.config.buffer_size));

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(buffer_size, read_half);
        let mut writer = BufWriter::with_capacity(buffer_size, write_half);

        self.tracker.set_phase(TransferPhase::Negotiating);

        // Init: filename, size, verification preference.
        protocol::send_command(&mut writer, Command::Init).await?;
        protocol::send_line(&mut writer, &self.source.name).await?;
        protocol::send_u64(&mut writer, self.source.size).await?;
        protocol::send_bool(&mut writer, self.config.verify_hash).await?;
        protocol::flush(&mut writer).await?;

        let pending = self.negotiate_resume(&mut reader, &mut writer).await?;

        self.tracker.set_phase(TransferPhase::Transferring);
        let mut controller = RateController::new(
            self.config.adaptive_delay,
            self.config.min_delay,
            self.config.max_delay,
        );

        let mut next_command = pending;
        loop {
            if shutdown.is_cancelled() {
                self.tracker.set_phase(TransferPhase::Cancelled);
                return Err(Error::Cancelled);
            }

            let command = match next_command.take() {
                Some(command) => command,
                None => timed(self.config.timeout, protocol::read_command(&mut reader)).await?,
            };

            match command {
                Command::Request => {
                    self.handle_request(&mut reader, &mut writer, &mut source_file, &mut controller)
                        .await?;
                }
                Command::HashAlgo => {
                    let algorithm =
                        timed(self.config.timeout, protocol::read_hash_algorithm(&mut reader))
                            .await?;
                    // The algorithm announcement is followed by the actual
                    // hash request; consume it before answering.
                    let request =
                        timed(self.config.timeout, protocol::read_command(&mut reader)).await?;
                    if request != Command::Hash {
                        return Err(Error::protocol(
                            "hash_request",
                            format!("expected Hash after HashAlgo, got {request:?}"),
                        ));
                    }
                    self.answer_hash_request(&mut reader, &mut writer, algorithm, false)
                        .await?;
                }
                Command::Hash => {
                    // Legacy receivers request a digest without announcing an
                    // algorithm first; md5 is implied.
                    self.answer_hash_request(&mut reader, &mut writer, HashAlgorithm::Md5, true)
                        .await?;
                }
                Command::Complete => {
                    self.tracker.set_phase(TransferPhase::Completed);
                    tracing::info!(
                        file = %self.source.name,
                        size = %file::format_size(self.source.size),
                        "Transfer completed successfully"
                    );
                    return Ok(());
                }
                Command::Error => {
                    let message =
                        timed(self.config.timeout, protocol::read_line(&mut reader)).await?;
                    self.tracker.set_phase(TransferPhase::Failed);
                    return Err(Error::Remote(message));
                }
                other => {
                    self.tracker.set_phase(TransferPhase::Failed);
                    return Err(Error::protocol(
                        "command_loop",
                        format!("unexpected command from server: {other:?}"),
                    ));
                }
            }
        }
    }

    /// Consume the server's first command. A `Resume` frame is negotiated
    /// here; anything else is returned for the main loop to dispatch.
    async fn negotiate_resume<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Option<Command>>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let first = timed(self.config.timeout, protocol::read_command(reader)).await?;
        if first != Command::Resume {
            return Ok(Some(first));
        }

        let info = timed(self.config.timeout, protocol::read_resume_info(reader)).await?;
        let accept = info.can_resume && info.total_chunks == self.grid.num_chunks;
        protocol::send_resume_ack(writer, accept).await?;

        if accept {
            let completed = info.completed_chunks.iter().filter(|c| **c).count() as u64;
            self.tracker
                .set_resumed(completed * self.grid.chunk_size, completed);
            tracing::info!(
                completed_chunks = completed,
                total_chunks = info.total_chunks,
                "Resuming transfer"
            );
        } else if info.can_resume {
            tracing::info!("Resume offer incompatible, starting fresh transfer");
        }

        Ok(None)
    }

    /// Serve one `Request`: read the chunk at the requested offset and send
    /// it, compressed or raw per the per-file policy.
    async fn handle_request<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        source_file: &mut File,
        controller: &mut RateController,
    ) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let offset = timed(self.config.timeout, protocol::read_u64(reader)).await?;

        let expected = self.grid.len_at(offset);
        if expected == 0 {
            return Err(Error::protocol(
                "chunk_request",
                format!("requested offset {offset} is beyond the end of the file"),
            ));
        }

        let delay = controller.delay(self.config.chunk_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut chunk = vec![0u8; usize::try_from(expected).map_err(|_| {
            Error::protocol("chunk_request", "chunk size out of range")
        })?];
        let n = file::read_at(source_file, offset, &mut chunk).await?;
        if n != chunk.len() {
            return Err(Error::filesystem(
                "read_chunk",
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "source file shorter than announced",
                ),
            ));
        }

        self.send_chunk_with_retries(writer, &chunk).await?;

        controller.record_chunk(expected);
        self.tracker.record_chunk(expected);
        Ok(())
    }

    /// Per-chunk retry envelope for the outbound data frame.
    async fn send_chunk_with_retries<W>(&self, writer: &mut W, chunk: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut last_err = None;

        for attempt in 0..self.config.retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                tracing::debug!(attempt = attempt + 1, "Retrying chunk send");
            }

            match self.send_chunk_data(writer, chunk).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Chunk send failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::network(
            "send_chunk",
            std::io::Error::other(last_err.unwrap_or(Error::Cancelled)),
        ))
    }

    async fn send_chunk_data<W>(&self, writer: &mut W, chunk: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        protocol::send_command(writer, Command::Data).await?;
        protocol::send_u64(writer, chunk.len() as u64).await?;

        if self.compress_chunks {
            let compressed = crate::compression::compress(chunk, self.compression_level)?;
            tracing::debug!(
                original = chunk.len(),
                compressed = compressed.len(),
                "Chunk compressed"
            );
            protocol::send_flag(writer, 1).await?;
            protocol::send_u64(writer, compressed.len() as u64).await?;
            protocol::send_bytes(writer, &compressed).await?;
        } else {
            protocol::send_flag(writer, 0).await?;
            protocol::send_bytes(writer, chunk).await?;
        }

        protocol::flush(writer).await
    }

    /// Hash the source fresh and reply, then wait for the receiver's verdict.
    async fn answer_hash_request<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        algorithm: HashAlgorithm,
        legacy: bool,
    ) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.tracker.set_phase(TransferPhase::Verifying);
        if legacy {
            tracing::info!("Legacy hash request, assuming md5");
        } else {
            tracing::info!(algorithm = %algorithm, "Received hash algorithm");
        }

        let digest = hash::hash_file(&self.config.file_path, algorithm).await?;

        protocol::send_command(writer, Command::Hash).await?;
        protocol::send_line(writer, &digest).await?;
        protocol::flush(writer).await?;

        let deadline = self.config.timeout.max(HASH_VERIFY_TIMEOUT);
        let verdict = timed(deadline, protocol::read_command(reader)).await?;
        match verdict {
            Command::Hash => {
                let message = timed(deadline, protocol::read_line(reader)).await?;
                if message == protocol::HASH_VERIFIED {
                    tracing::info!(algorithm = %algorithm, "Hash verified by receiver");
                } else {
                    tracing::warn!(message = %message, "Unexpected hash verification response");
                }
                Ok(())
            }
            Command::Error => {
                let message = timed(deadline, protocol::read_line(reader)).await?;
                tracing::error!(message = %message, "Hash verification failed on receiver");
                self.tracker.set_phase(TransferPhase::Failed);
                Err(Error::Integrity { algorithm })
            }
            other => Err(Error::protocol(
                "hash_verdict",
                format!("unexpected response after hash: {other:?}"),
            )),
        }
    }
}
