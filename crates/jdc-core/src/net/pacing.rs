//! Adaptive inter-chunk pacing.
//!
//! The controller smooths observed per-chunk throughput with an exponential
//! moving average and scales the configured base delay by a bounded
//! multiplier: regressing throughput backs off (multiplier grows 1.2x),
//! improving throughput tightens (shrinks 0.8x). The growth and shrink
//! factors are intentionally asymmetric in log space, a conservative bias
//! toward pacing down that the [0.1, 10.0] clamp keeps bounded.

use std::time::{Duration, Instant};

/// Bounds for the delay multiplier.
const MULTIPLIER_MIN: f64 = 0.1;
const MULTIPLIER_MAX: f64 = 10.0;

/// Throughput-driven delay controller for one transfer.
#[derive(Debug)]
pub struct RateController {
    last_chunk_at: Instant,
    avg_rate: f64,
    multiplier: f64,
    adaptive: bool,
    min_delay: Duration,
    max_delay: Duration,
}

impl RateController {
    /// Create a controller. When `adaptive` is false, [`Self::delay`] returns
    /// the base delay verbatim.
    #[must_use]
    pub fn new(adaptive: bool, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            last_chunk_at: Instant::now(),
            avg_rate: 0.0,
            multiplier: 1.0,
            adaptive,
            min_delay,
            max_delay,
        }
    }

    /// Record a completed chunk of `bytes` and update the rate statistics.
    pub fn record_chunk(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_chunk_at);
        self.last_chunk_at = now;

        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        let current_rate = bytes as f64 / secs;
        let previous = self.multiplier;

        if self.avg_rate == 0.0 {
            self.avg_rate = current_rate;
        } else {
            self.avg_rate = 0.7 * self.avg_rate + 0.3 * current_rate;
        }

        if current_rate < 0.7 * self.avg_rate {
            self.multiplier *= 1.2;
        } else if current_rate > 1.2 * self.avg_rate {
            self.multiplier *= 0.8;
        }
        self.multiplier = self.multiplier.clamp(MULTIPLIER_MIN, MULTIPLIER_MAX);

        if (self.multiplier - previous).abs() > f64::EPSILON {
            let direction = if self.multiplier > previous {
                "congestion"
            } else {
                "improving"
            };
            tracing::debug!(
                current_rate_mbps = current_rate / (1024.0 * 1024.0),
                avg_rate_mbps = self.avg_rate / (1024.0 * 1024.0),
                multiplier = self.multiplier,
                "Network {direction}"
            );
        }
    }

    /// Delay to apply before the next chunk.
    ///
    /// Adaptive mode scales `base` by the multiplier and clamps to the
    /// configured bounds; otherwise `base` passes through untouched.
    #[must_use]
    pub fn delay(&self, base: Duration) -> Duration {
        if !self.adaptive {
            return base;
        }
        Duration::from_secs_f64(base.as_secs_f64() * self.multiplier)
            .clamp(self.min_delay, self.max_delay)
    }

    /// Smoothed transfer rate in bytes per second.
    #[must_use]
    pub fn avg_rate(&self) -> f64 {
        self.avg_rate
    }

    /// Current delay multiplier.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}
