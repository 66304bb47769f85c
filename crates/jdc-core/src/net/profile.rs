//! Connection profiling via ping/pong round trips.
//!
//! Before the transfer starts, the client opens a second short-lived
//! connection to the server and measures RTT with up to five ping frames.
//! The average RTT seeds a coarse bandwidth estimate, and the
//! bandwidth-delay product yields a recommended chunk size. Profiling is
//! best-effort: any failure or timeout falls back to defaults and is never
//! fatal.

use std::time::{Duration, Instant};

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::protocol::{self, Command};

/// Number of ping probes per profiling run.
pub const PING_COUNT: u32 = 5;

/// Overall budget for a profiling run.
pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between consecutive pings.
const PING_SPACING: Duration = Duration::from_millis(100);

/// Recommended chunk-size bounds from the bandwidth-delay product.
const MIN_OPTIMAL_CHUNK: u64 = 512 * 1024;
const MAX_OPTIMAL_CHUNK: u64 = 8 * 1024 * 1024;

/// Measured network characteristics and the derived recommendation.
#[derive(Debug, Clone, Copy)]
pub struct NetworkProfile {
    /// Average round-trip time
    pub rtt: Duration,
    /// Estimated bandwidth in bytes per second
    pub bandwidth: u64,
    /// Recommended chunk size from the bandwidth-delay product
    pub optimal_chunk_size: u64,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            rtt: Duration::from_millis(100),
            bandwidth: 10 * 1024 * 1024,
            optimal_chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Profile the path to `addr` with a transient connection.
///
/// Returns defaults if the connection cannot be established or no ping
/// completes within the budget.
pub async fn profile_network(addr: &str) -> NetworkProfile {
    match tokio::time::timeout(PROFILE_TIMEOUT, measure_rtt(addr)).await {
        Ok(Ok(Some(rtt))) => from_rtt(rtt),
        Ok(Ok(None)) => {
            tracing::warn!("No ping completed, using default network profile");
            NetworkProfile::default()
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Network profiling failed, using defaults");
            NetworkProfile::default()
        }
        Err(_) => {
            tracing::info!("Network profiling timed out, using defaults");
            NetworkProfile::default()
        }
    }
}

async fn measure_rtt(addr: &str) -> Result<Option<Duration>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| crate::Error::network("profile_connect", e))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let mut total = Duration::ZERO;
    let mut successful = 0u32;

    for i in 0..PING_COUNT {
        let start = Instant::now();

        if protocol::send_command(&mut writer, Command::Ping)
            .await
            .and(protocol::flush(&mut writer).await)
            .is_err()
        {
            continue;
        }

        match protocol::read_command(&mut reader).await {
            Ok(Command::Pong) => {
                total += start.elapsed();
                successful += 1;
            }
            Ok(other) => {
                tracing::debug!(?other, "Unexpected response to ping");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ping read failed");
            }
        }

        if i + 1 < PING_COUNT {
            tokio::time::sleep(PING_SPACING).await;
        }
    }

    if successful == 0 {
        return Ok(None);
    }
    Ok(Some(total / successful))
}

/// Derive the bandwidth estimate and chunk-size recommendation from RTT.
#[must_use]
pub fn from_rtt(rtt: Duration) -> NetworkProfile {
    let bandwidth: u64 = if rtt < Duration::from_millis(10) {
        50 * 1024 * 1024
    } else if rtt < Duration::from_millis(50) {
        20 * 1024 * 1024
    } else if rtt < Duration::from_millis(100) {
        10 * 1024 * 1024
    } else {
        5 * 1024 * 1024
    };

    let bdp = bandwidth as f64 * rtt.as_secs_f64();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut optimal = (bdp as u64).clamp(MIN_OPTIMAL_CHUNK, MAX_OPTIMAL_CHUNK);

    // Long paths benefit from larger chunks; keep the cap.
    if rtt > Duration::from_millis(50) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let increased = (optimal as f64 * 1.5) as u64;
        if increased <= MAX_OPTIMAL_CHUNK {
            optimal = increased;
        }
    }

    NetworkProfile {
        rtt,
        bandwidth,
        optimal_chunk_size: optimal,
    }
}
