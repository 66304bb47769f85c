//! Wire protocol codec.
//!
//! Every frame is one command byte followed by its payload: newline-terminated
//! ASCII lines for strings, integers, and booleans, plus raw binary blocks for
//! chunk data. The codec exposes primitives only; frame sequencing lives in
//! the transfer drivers.
//!
//! ```text
//! Init       C->S  filename \n  file-size \n  verify-preference \n
//! Request    S->C  offset \n
//! Data       C->S  size \n  flag byte  [compressed-size \n  bytes] | [bytes]
//! Resume     S->C  flag byte  [offset \n  total \n  completed-indices \n]
//! ResumeAck  C->S  flag byte
//! HashAlgo   S->C  algorithm \n
//! Hash       *     hash-string \n (empty when used as a request)
//! Error      *     message \n
//! ```
//!
//! Encoders buffer; callers flush before awaiting a reply. Readers are used
//! under per-operation deadlines via [`timed`]; a deadline that fires
//! mid-frame is fatal to the connection.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

/// Protocol version carried by the reserved `Version` command.
pub const PROTOCOL_VERSION: i64 = 1;

/// Upper bound on a single payload line (a resume index list for a very
/// large grid is the longest legitimate line).
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Acknowledgment string sent by the receiver after a successful hash check.
pub const HASH_VERIFIED: &str = "HASH_VERIFIED";

/// Command operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Initialize a transfer (client to server)
    Init = 1,
    /// Request a chunk at an offset (server to client)
    Request = 2,
    /// Chunk data (client to server)
    Data = 3,
    /// Transfer complete (server to client)
    Complete = 4,
    /// Error message (either direction)
    Error = 5,
    /// Hash request or hash value (either direction)
    Hash = 6,
    /// Hash algorithm announcement (server to client)
    HashAlgo = 7,
    /// Profiling ping (either direction)
    Ping = 8,
    /// Profiling pong (either direction)
    Pong = 9,
    /// Protocol version negotiation (reserved)
    Version = 10,
    /// Resume information (server to client)
    Resume = 11,
    /// Resume acknowledgment (client to server)
    ResumeAck = 12,
}

impl Command {
    /// Parse a command from its wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Init),
            2 => Some(Self::Request),
            3 => Some(Self::Data),
            4 => Some(Self::Complete),
            5 => Some(Self::Error),
            6 => Some(Self::Hash),
            7 => Some(Self::HashAlgo),
            8 => Some(Self::Ping),
            9 => Some(Self::Pong),
            10 => Some(Self::Version),
            11 => Some(Self::Resume),
            12 => Some(Self::ResumeAck),
            _ => None,
        }
    }
}

/// Resume information sent by the server before the first chunk request.
///
/// `resume_offset` is advisory; the authoritative record is the completed
/// bitmap.
#[derive(Debug, Clone, Default)]
pub struct ResumeInfo {
    /// Whether the server found a compatible partial transfer
    pub can_resume: bool,
    /// Advisory byte offset already on disk
    pub resume_offset: u64,
    /// Chunk count for the transfer grid
    pub total_chunks: u64,
    /// Per-chunk received flags, `total_chunks` entries
    pub completed_chunks: Vec<bool>,
}

/// Await a protocol future under a deadline.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the deadline elapses, otherwise the future's
/// own result.
pub async fn timed<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
}

/// Read one command byte.
///
/// # Errors
///
/// Returns a network error on transport failure or a protocol error for an
/// unknown command byte.
pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let byte = reader
        .read_u8()
        .await
        .map_err(|e| Error::network("read_command", e))?;
    Command::from_byte(byte)
        .ok_or_else(|| Error::protocol("read_command", format!("unknown command byte: {byte}")))
}

/// Write one command byte (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_command<W>(writer: &mut W, command: Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_u8(command as u8)
        .await
        .map_err(|e| Error::network("send_command", e))
}

/// Read a raw flag byte (compression and resume flags are bare bytes, not
/// commands).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn read_flag<R>(reader: &mut R) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_u8()
        .await
        .map_err(|e| Error::network("read_flag", e))
}

/// Write a raw flag byte (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_flag<W>(writer: &mut W, flag: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_u8(flag)
        .await
        .map_err(|e| Error::network("send_flag", e))
}

/// Read a newline-terminated UTF-8 line, without the terminator, trimmed.
///
/// # Errors
///
/// Returns a network error on transport failure, or a protocol error if the
/// line exceeds [`MAX_LINE_LEN`], ends without a terminator, or is not UTF-8.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| Error::network("read_line", e))?;

    if n == 0 {
        return Err(Error::network(
            "read_line",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
        ));
    }
    if buf.last() != Some(&b'\n') {
        return Err(Error::protocol(
            "read_line",
            if buf.len() > MAX_LINE_LEN {
                "line exceeds maximum length"
            } else {
                "missing line terminator"
            },
        ));
    }
    buf.pop();

    let line = String::from_utf8(buf)
        .map_err(|_| Error::protocol("read_line", "line is not valid UTF-8"))?;
    Ok(line.trim().to_string())
}

/// Write a newline-terminated line (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::network("send_line", e))?;
    writer
        .write_u8(b'\n')
        .await
        .map_err(|e| Error::network("send_line", e))
}

/// Read a signed 64-bit integer line.
///
/// # Errors
///
/// Returns a protocol error if the line is not a decimal integer.
pub async fn read_i64<R>(reader: &mut R) -> Result<i64>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    line.parse::<i64>()
        .map_err(|_| Error::protocol("read_i64", format!("invalid integer: {line}")))
}

/// Read a non-negative 64-bit integer line (sizes, offsets, counts).
///
/// # Errors
///
/// Returns a protocol error if the line is not a non-negative integer.
pub async fn read_u64<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let value = read_i64(reader).await?;
    u64::try_from(value)
        .map_err(|_| Error::protocol("read_u64", format!("negative value: {value}")))
}

/// Write an integer line (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_i64<W>(writer: &mut W, value: i64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_line(writer, &value.to_string()).await
}

/// Write a non-negative integer line (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_u64<W>(writer: &mut W, value: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_line(writer, &value.to_string()).await
}

/// Read a `true`/`false` line.
///
/// # Errors
///
/// Returns a protocol error for any other token.
pub async fn read_bool<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    match line.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::protocol(
            "read_bool",
            format!("invalid boolean: {other}"),
        )),
    }
}

/// Write a `true`/`false` line (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_bool<W>(writer: &mut W, value: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_line(writer, if value { "true" } else { "false" }).await
}

/// Fill `buf` from the stream exactly.
///
/// # Errors
///
/// Returns a network error on transport failure or premature EOF.
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| Error::network("read_data", e))
}

/// Write a raw binary block (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_bytes<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .map_err(|e| Error::network("send_data", e))
}

/// Flush the writer.
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn flush<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.flush().await.map_err(|e| Error::network("flush", e))
}

/// Send an `Error` frame and flush.
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_error<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_command(writer, Command::Error).await?;
    send_line(writer, message).await?;
    flush(writer).await
}

/// Send a `Resume` frame and flush.
///
/// A fresh transfer sends only the zero flag byte; a resumable one adds the
/// advisory offset, the chunk count, and the comma-separated list of
/// completed chunk indices.
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_resume_info<W>(writer: &mut W, info: &ResumeInfo) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_command(writer, Command::Resume).await?;

    if info.can_resume {
        send_flag(writer, 1).await?;
        send_u64(writer, info.resume_offset).await?;
        send_u64(writer, info.total_chunks).await?;

        let completed = info
            .completed_chunks
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(i, _)| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        send_line(writer, &completed).await?;
    } else {
        send_flag(writer, 0).await?;
    }

    flush(writer).await
}

/// Read the payload of a `Resume` frame (the command byte has already been
/// consumed).
///
/// Out-of-range indices in the completed list are ignored, matching the
/// tolerant wire behavior of existing peers.
///
/// # Errors
///
/// Returns a network or protocol error if the payload cannot be read.
pub async fn read_resume_info<R>(reader: &mut R) -> Result<ResumeInfo>
where
    R: AsyncBufRead + Unpin,
{
    let flag = read_flag(reader).await?;
    if flag != 1 {
        return Ok(ResumeInfo::default());
    }

    let resume_offset = read_u64(reader).await?;
    let total_chunks = read_u64(reader).await?;
    let list = read_line(reader).await?;

    let total = usize::try_from(total_chunks)
        .map_err(|_| Error::protocol("read_resume_info", "total chunk count out of range"))?;
    let mut completed_chunks = vec![false; total];

    if !list.is_empty() {
        for entry in list.split(',') {
            if let Ok(index) = entry.trim().parse::<usize>() {
                if index < total {
                    completed_chunks[index] = true;
                }
            }
        }
    }

    Ok(ResumeInfo {
        can_resume: true,
        resume_offset,
        total_chunks,
        completed_chunks,
    })
}

/// Send a `ResumeAck` frame and flush.
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_resume_ack<W>(writer: &mut W, accepted: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_command(writer, Command::ResumeAck).await?;
    send_flag(writer, u8::from(accepted)).await?;
    flush(writer).await
}

/// Read the payload of a `ResumeAck` frame (the command byte has already been
/// consumed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn read_resume_ack<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    Ok(read_flag(reader).await? == 1)
}

/// Send a `HashAlgo` frame (buffered, not flushed).
///
/// # Errors
///
/// Returns a network error on transport failure.
pub async fn send_hash_algorithm<W>(writer: &mut W, algorithm: HashAlgorithm) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_command(writer, Command::HashAlgo).await?;
    send_line(writer, algorithm.as_str()).await
}

/// Read the payload of a `HashAlgo` frame (the command byte has already been
/// consumed). Unknown algorithm tokens fail the frame.
///
/// # Errors
///
/// Returns a protocol error for an unsupported algorithm token.
pub async fn read_hash_algorithm<R>(reader: &mut R) -> Result<HashAlgorithm>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader).await?.parse()
}
