//! Network tuning, adaptive pacing, and RTT profiling.

pub mod pacing;
pub mod profile;

pub use pacing::RateController;
pub use profile::{profile_network, NetworkProfile};

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// TCP keep-alive idle time applied to transfer connections.
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Apply socket options to a transfer connection.
///
/// Called once, right after accept/connect and before any frame: Nagle off
/// (frames are small and latency-sensitive), keep-alive on to detect dead
/// peers, and enlarged kernel buffers for throughput. Keep-alive and buffer
/// sizing failures only log; nodelay failure is surfaced.
///
/// # Errors
///
/// Returns a network error if nodelay cannot be set.
pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| Error::network("set_nodelay", e))?;

    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = socket_ref.set_tcp_keepalive(&keepalive) {
        tracing::warn!(error = %e, "Failed to enable TCP keep-alive");
    }

    if let Err(e) = socket_ref.set_recv_buffer_size(crate::TCP_BUFFER_SIZE) {
        tracing::warn!(error = %e, "Failed to set TCP receive buffer");
    }
    if let Err(e) = socket_ref.set_send_buffer_size(crate::TCP_BUFFER_SIZE) {
        tracing::warn!(error = %e, "Failed to set TCP send buffer");
    }

    Ok(())
}
