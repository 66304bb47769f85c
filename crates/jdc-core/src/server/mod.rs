//! The receiver: TCP listener and per-transfer state machine.
//!
//! Each accepted connection owns at most one transfer. The server drives the
//! conversation: after the client's `Init` it negotiates resume, then pulls
//! chunks in strictly ascending index order with a single outstanding request,
//! writing each chunk at its absolute offset and durably recording it before
//! the next request goes out. Completed transfers optionally end with the
//! hash handshake.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{self, ChunkGrid};
use crate::hash;
use crate::net::{self, RateController};
use crate::progress::{ProgressTracker, TransferPhase};
use crate::protocol::{self, timed, Command, ResumeInfo};
use crate::state::{self, TransferState};

/// Floor for the hash-handshake deadline; hashing a large file back from
/// disk takes longer than a chunk-class operation.
const HASH_VERIFY_TIMEOUT: Duration = Duration::from_secs(300);

/// The receiving side of a transfer.
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    /// Validate the configuration, create the output directory, and bind the
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad configuration or a network error
    /// if the address cannot be bound.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| Error::filesystem("create_output_dir", e))?;

        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| Error::network("listen", e))?;

        tracing::info!(
            address = %config.listen_address,
            workers = config.workers,
            "Server ready to accept connections"
        );

        Ok(Self { listener, config })
    }

    /// The bound listen address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Returns a network error if the socket has no local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::network("local_addr", e))
    }

    /// Accept and serve connections until the token is cancelled.
    ///
    /// Each connection is handled in its own task; transfers share nothing
    /// but the listening socket.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` on shutdown; accept failures are logged
    /// and the loop continues.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(remote_addr = %peer, "New connection");
                            let config = self.config.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, &config, &shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

/// Pre-transfer command loop for one connection: answer pings, dispatch the
/// transfer on `Init`, close on anything else.
async fn handle_connection(stream: TcpStream, config: &Config, shutdown: &CancellationToken) {
    if let Err(e) = net::configure_stream(&stream) {
        tracing::warn!(error = %e, "Failed to tune TCP connection");
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(config.buffer_size, read_half);
    let mut writer = BufWriter::with_capacity(config.buffer_size, write_half);

    loop {
        let command = match timed(config.timeout, protocol::read_command(&mut reader)).await {
            Ok(command) => command,
            Err(Error::Network { source, .. })
                if source.kind() == io::ErrorKind::UnexpectedEof =>
            {
                tracing::info!("Connection closed by client");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read command");
                return;
            }
        };

        match command {
            Command::Init => {
                match handle_transfer(&mut reader, &mut writer, config, shutdown).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        tracing::info!("Transfer cancelled, state saved");
                    }
                    Err(e) => {
                        tracing::error!(
                            category = e.category(),
                            error = %e,
                            "Transfer failed"
                        );
                    }
                }
                return;
            }
            Command::Ping => {
                let pong = protocol::send_command(&mut writer, Command::Pong).await;
                if pong.is_err() || protocol::flush(&mut writer).await.is_err() {
                    tracing::error!("Failed to answer ping");
                    return;
                }
            }
            other => {
                tracing::error!(command = ?other, "Unknown command before transfer");
                let _ = protocol::send_error(&mut writer, "Unknown command").await;
                return;
            }
        }
    }
}

/// Send an error frame to the peer and surface `err` locally.
async fn abort<W, T>(writer: &mut W, message: &str, err: Error) -> Result<T>
where
    W: AsyncWrite + Unpin,
{
    let _ = protocol::send_error(writer, message).await;
    Err(err)
}

/// The transfer state machine, from metadata to `Complete`.
#[allow(clippy::too_many_lines)]
async fn handle_transfer<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = config.timeout;

    // Metadata: filename, size, and the client's verification preference.
    let filename = match timed(deadline, protocol::read_line(reader)).await {
        Ok(v) => v,
        Err(e) => return abort(writer, "Failed to read filename", e).await,
    };
    let file_size = match timed(deadline, protocol::read_u64(reader)).await {
        Ok(v) => v,
        Err(e) => return abort(writer, "Failed to read file size", e).await,
    };
    let client_wants_verification = match timed(deadline, protocol::read_bool(reader)).await {
        Ok(v) => v,
        Err(e) => return abort(writer, "Failed to read verification preference", e).await,
    };

    if file_size == 0 {
        return abort(
            writer,
            "Invalid file size",
            Error::protocol("init", "file size must be positive"),
        )
        .await;
    }

    let basename = match file::sanitize_basename(&filename) {
        Ok(v) => v,
        Err(e) => return abort(writer, "Invalid filename", e).await,
    };

    let grid = ChunkGrid::new(file_size, config.chunk_size);
    let output_path = config.output_dir.join(&basename);

    let should_verify = config.verify_hash && client_wants_verification;
    tracing::info!(
        size = %file::format_size(file_size),
        chunks = grid.num_chunks,
        verify = should_verify,
        "Receiving file"
    );

    // Adopt compatible on-disk state, otherwise start a fresh bitmap.
    let (mut transfer_state, mut resuming) = load_or_fresh(config, &basename, &grid).await;

    let resume_info = ResumeInfo {
        can_resume: resuming,
        resume_offset: transfer_state.resume_offset(),
        total_chunks: grid.num_chunks,
        completed_chunks: transfer_state.chunks_received.clone(),
    };
    if let Err(e) = protocol::send_resume_info(writer, &resume_info).await {
        return abort(writer, "Resume negotiation failed", e).await;
    }

    let client_accepts = match wait_for_resume_decision(reader, deadline).await {
        Ok(v) => v,
        Err(e) => return abort(writer, "Resume negotiation failed", e).await,
    };

    if resuming && !client_accepts {
        tracing::info!("Client rejected resume, starting fresh transfer");
        resuming = false;
        transfer_state = TransferState::new(&basename, &grid);
        discard_partial(config, &basename, &output_path).await;
    }

    let mut out_file = match open_output(&output_path, resuming).await {
        Ok(v) => v,
        Err(e) => return abort(writer, "File creation failed", e).await,
    };

    if !resuming {
        if let Err(e) = file::preallocate(&out_file, file_size).await {
            tracing::warn!(error = %e, "Failed to preallocate output file");
        }
    }

    let mut tracker = ProgressTracker::new(&basename, file_size, grid.num_chunks);
    if resuming {
        tracker.set_resumed(transfer_state.resume_offset(), transfer_state.received_count());
        tracing::info!(
            completed_chunks = transfer_state.received_count(),
            "Resuming transfer"
        );
    }
    tracker.set_phase(TransferPhase::Transferring);

    let mut controller =
        RateController::new(config.adaptive_delay, config.min_delay, config.max_delay);

    // Pull chunks in ascending order, one outstanding request at a time.
    // Grid indices fit usize: the bitmap was allocated with num_chunks slots.
    #[allow(clippy::cast_possible_truncation)]
    for index in 0..grid.num_chunks {
        if shutdown.is_cancelled() {
            save_best_effort(&mut transfer_state, config).await;
            tracker.set_phase(TransferPhase::Cancelled);
            return Err(Error::Cancelled);
        }

        if transfer_state.chunks_received[index as usize] {
            continue;
        }

        let delay = controller.delay(config.chunk_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let received = match receive_chunk_with_retries(
            reader, writer, &mut out_file, &grid, index, config, shutdown,
        )
        .await
        {
            Ok(n) => n,
            Err(e) => {
                save_best_effort(&mut transfer_state, config).await;
                if matches!(e, Error::Cancelled) {
                    tracker.set_phase(TransferPhase::Cancelled);
                    return Err(e);
                }
                tracker.set_phase(TransferPhase::Failed);
                return abort(writer, "Transfer failed", e).await;
            }
        };

        transfer_state.chunks_received[index as usize] = true;
        controller.record_chunk(received);
        tracker.record_chunk(received);

        // Durable save happens-before the next request goes out.
        if let Err(e) = state::save(&mut transfer_state, &config.output_dir).await {
            tracing::error!(chunk = index, error = %e, "Failed to save transfer state");
        }
    }

    out_file
        .sync_all()
        .await
        .map_err(|e| Error::filesystem("sync_output", e))?;

    if should_verify {
        tracker.set_phase(TransferPhase::Verifying);
        if let Err(e) = verify_file_hash(reader, writer, &output_path, file_size, config).await {
            tracker.set_phase(TransferPhase::Failed);
            discard_partial(config, &basename, &output_path).await;
            if matches!(e, Error::Integrity { .. }) {
                // The mismatch frame with both digests already went out.
                return Err(e);
            }
            return abort(writer, "Hash verification failed", e).await;
        }
    }

    if let Err(e) = state::remove(&config.output_dir, &basename).await {
        tracing::warn!(error = %e, "Failed to remove transfer state");
    }

    protocol::send_command(writer, Command::Complete).await?;
    protocol::flush(writer).await?;

    tracker.set_phase(TransferPhase::Completed);
    tracing::info!(
        size = %file::format_size(file_size),
        "Transfer completed successfully"
    );
    Ok(())
}

async fn load_or_fresh(
    config: &Config,
    basename: &str,
    grid: &ChunkGrid,
) -> (TransferState, bool) {
    if let Some(existing) = state::load(&config.output_dir, basename).await {
        if existing.is_compatible(grid) {
            tracing::info!("Found compatible transfer state, resuming");
            return (existing, true);
        }
        tracing::warn!("Incompatible transfer state found, starting fresh");
    }
    (TransferState::new(basename, grid), false)
}

async fn wait_for_resume_decision<R>(reader: &mut R, deadline: Duration) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let command = timed(deadline, protocol::read_command(reader)).await?;
    if command != Command::ResumeAck {
        return Err(Error::protocol(
            "resume_decision",
            format!("expected ResumeAck, got {command:?}"),
        ));
    }
    timed(deadline, protocol::read_resume_ack(reader)).await
}

/// Remove the partial output and its state document.
async fn discard_partial(config: &Config, basename: &str, output_path: &Path) {
    match tokio::fs::remove_file(output_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "Failed to remove partial file"),
    }
    if let Err(e) = state::remove(&config.output_dir, basename).await {
        tracing::warn!(error = %e, "Failed to remove transfer state");
    }
}

async fn open_output(path: &Path, resuming: bool) -> Result<File> {
    if resuming {
        match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
        {
            Ok(file) => return Ok(file),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open existing file, creating new");
            }
        }
    }

    File::create(path)
        .await
        .map_err(|e| Error::filesystem("create_output", e))
}

async fn save_best_effort(transfer_state: &mut TransferState, config: &Config) {
    if let Err(e) = state::save(transfer_state, &config.output_dir).await {
        tracing::error!(error = %e, "Failed to save transfer state");
    }
}

/// Per-chunk retry envelope: linear backoff, same request re-sent.
async fn receive_chunk_with_retries<R, W>(
    reader: &mut R,
    writer: &mut W,
    out_file: &mut File,
    grid: &ChunkGrid,
    index: u64,
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<u64>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut last_err = None;

    for attempt in 0..config.retries.max(1) {
        if shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            tracing::debug!(offset = grid.offset(index), attempt = attempt + 1, "Retrying chunk");
        }

        match receive_chunk(reader, writer, out_file, grid, index, config).await {
            Ok(n) => return Ok(n),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    offset = grid.offset(index),
                    attempt = attempt + 1,
                    error = %e,
                    "Chunk receive failed"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::network(
        "receive_chunk",
        io::Error::other(last_err.unwrap_or(Error::Cancelled)),
    ))
}

/// One request/data exchange: `Request(offset)` out, chunk bytes in, write
/// at the offset.
async fn receive_chunk<R, W>(
    reader: &mut R,
    writer: &mut W,
    out_file: &mut File,
    grid: &ChunkGrid,
    index: u64,
    config: &Config,
) -> Result<u64>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = config.timeout;
    let offset = grid.offset(index);

    protocol::send_command(writer, Command::Request).await?;
    protocol::send_u64(writer, offset).await?;
    protocol::flush(writer).await?;

    let command = timed(deadline, protocol::read_command(reader)).await?;
    match command {
        Command::Data => {}
        Command::Error => {
            let message = timed(deadline, protocol::read_line(reader)).await?;
            return Err(Error::Remote(message));
        }
        other => {
            return Err(Error::protocol(
                "receive_chunk",
                format!("expected Data, got {other:?}"),
            ));
        }
    }

    let size = timed(deadline, protocol::read_u64(reader)).await?;
    if size == 0 || size > grid.chunk_size {
        return Err(Error::protocol(
            "receive_chunk",
            format!("invalid chunk size: {size}"),
        ));
    }
    let size_usize = usize::try_from(size)
        .map_err(|_| Error::protocol("receive_chunk", "chunk size out of range"))?;

    let flag = timed(deadline, protocol::read_flag(reader)).await?;
    let data = match flag {
        1 => {
            let compressed_size = timed(deadline, protocol::read_u64(reader)).await?;
            // Worst-case gzip expansion is small; anything far beyond the
            // chunk size is a framing error, not a payload.
            if compressed_size > grid.chunk_size + 64 * 1024 {
                return Err(Error::protocol(
                    "receive_chunk",
                    format!("implausible compressed size: {compressed_size}"),
                ));
            }
            let mut compressed = vec![
                0u8;
                usize::try_from(compressed_size).map_err(|_| {
                    Error::protocol("receive_chunk", "compressed size out of range")
                })?
            ];
            timed(deadline, protocol::read_exact(reader, &mut compressed)).await?;
            crate::compression::decompress(&compressed, size_usize)?
        }
        0 => {
            let mut raw = vec![0u8; size_usize];
            timed(deadline, protocol::read_exact(reader, &mut raw)).await?;
            raw
        }
        other => {
            return Err(Error::protocol(
                "receive_chunk",
                format!("invalid compression flag: {other}"),
            ));
        }
    };

    file::write_at(out_file, offset, &data).await?;
    Ok(size)
}

/// Three-frame hash handshake, server side.
async fn verify_file_hash<R, W>(
    reader: &mut R,
    writer: &mut W,
    output_path: &Path,
    file_size: u64,
    config: &Config,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = config.timeout.max(HASH_VERIFY_TIMEOUT);
    let algorithm = hash::select_algorithm(file_size);

    protocol::send_hash_algorithm(writer, algorithm).await?;
    protocol::send_command(writer, Command::Hash).await?;
    protocol::flush(writer).await?;

    let command = timed(deadline, protocol::read_command(reader)).await?;
    if command != Command::Hash {
        return Err(Error::protocol(
            "verify_hash",
            format!("expected Hash, got {command:?}"),
        ));
    }
    let source_hash = timed(deadline, protocol::read_line(reader)).await?;

    let received_hash = hash::hash_file(output_path, algorithm).await?;

    if source_hash != received_hash {
        let message = format!(
            "Hash mismatch ({algorithm}): source={source_hash}, received={received_hash}"
        );
        let _ = protocol::send_error(writer, &message).await;
        return Err(Error::Integrity { algorithm });
    }

    protocol::send_command(writer, Command::Hash).await?;
    protocol::send_line(writer, protocol::HASH_VERIFIED).await?;
    protocol::flush(writer).await?;

    tracing::info!(algorithm = %algorithm, "File hash verified successfully");
    Ok(())
}
