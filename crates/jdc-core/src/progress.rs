//! Transfer progress reporting.
//!
//! The sender session publishes [`TransferProgress`] snapshots over a watch
//! channel for UI consumption; both drivers additionally emit rate-limited
//! tracing events so headless runs still show movement in the logs.

use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Opening files and connecting
    Preparing,
    /// Resume negotiation in flight
    Negotiating,
    /// Chunks moving
    Transferring,
    /// End-to-end hash handshake
    Verifying,
    /// Finished successfully
    Completed,
    /// Aborted by error
    Failed,
    /// Aborted by shutdown
    Cancelled,
}

/// A point-in-time snapshot of transfer progress.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current phase
    pub phase: TransferPhase,
    /// Basename of the file in flight
    pub filename: String,
    /// Bytes accounted for so far (including resumed chunks)
    pub bytes_transferred: u64,
    /// Total bytes in the file
    pub total_bytes: u64,
    /// Chunks completed so far
    pub chunks_done: u64,
    /// Chunks in the grid
    pub total_chunks: u64,
    /// Observed transfer rate in bytes per second
    pub rate_bps: u64,
    /// When the session started
    pub started_at: Instant,
}

impl TransferProgress {
    /// Empty snapshot for a file of `total_bytes` across `total_chunks`.
    #[must_use]
    pub fn new(filename: &str, total_bytes: u64, total_chunks: u64) -> Self {
        Self {
            phase: TransferPhase::Preparing,
            filename: filename.to_string(),
            bytes_transferred: 0,
            total_bytes,
            chunks_done: 0,
            total_chunks,
            rate_bps: 0,
            started_at: Instant::now(),
        }
    }

    /// Completion percentage in `[0.0, 100.0]`.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Minimum spacing between chunk-progress log events.
const LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Publishes progress snapshots and rate-limited log lines.
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<TransferProgress>,
    rx: watch::Receiver<TransferProgress>,
    last_logged: Instant,
}

impl ProgressTracker {
    /// Create a tracker seeded with an initial snapshot.
    #[must_use]
    pub fn new(filename: &str, total_bytes: u64, total_chunks: u64) -> Self {
        let (tx, rx) = watch::channel(TransferProgress::new(filename, total_bytes, total_chunks));
        Self {
            tx,
            rx,
            last_logged: Instant::now(),
        }
    }

    /// Subscribe to progress snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.rx.clone()
    }

    /// Move to a new phase.
    pub fn set_phase(&self, phase: TransferPhase) {
        self.tx.send_modify(|p| p.phase = phase);
    }

    /// Seed the counters with already-completed work (resume).
    pub fn set_resumed(&self, bytes: u64, chunks: u64) {
        self.tx.send_modify(|p| {
            p.bytes_transferred = bytes;
            p.chunks_done = chunks;
        });
    }

    /// Account one completed chunk and emit a log line if enough time has
    /// passed since the last one.
    pub fn record_chunk(&mut self, bytes: u64) {
        self.tx.send_modify(|p| {
            p.bytes_transferred += bytes;
            p.chunks_done += 1;
            let elapsed = p.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    p.rate_bps = (p.bytes_transferred as f64 / elapsed) as u64;
                }
            }
        });

        if self.last_logged.elapsed() >= LOG_INTERVAL {
            self.last_logged = Instant::now();
            let p = self.rx.borrow().clone();
            tracing::info!(
                chunks_done = p.chunks_done,
                total_chunks = p.total_chunks,
                percent = %format!("{:.1}", p.percentage()),
                rate = %crate::file::format_size(p.rate_bps),
                "Transfer progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let mut progress = TransferProgress::new("data.bin", 1000, 1);
        assert!((progress.percentage() - 0.0).abs() < f64::EPSILON);

        progress.bytes_transferred = 500;
        assert!((progress.percentage() - 50.0).abs() < f64::EPSILON);

        progress.bytes_transferred = 1000;
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_file_is_complete() {
        let progress = TransferProgress::new("empty.bin", 0, 0);
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tracker_accumulates() {
        let mut tracker = ProgressTracker::new("data.bin", 4096, 4);
        let rx = tracker.subscribe();

        tracker.record_chunk(1024);
        tracker.record_chunk(1024);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.bytes_transferred, 2048);
        assert_eq!(snapshot.chunks_done, 2);
    }

    #[test]
    fn test_tracker_resume_seed() {
        let tracker = ProgressTracker::new("data.bin", 10 * 1024, 10);
        tracker.set_resumed(3 * 1024, 3);

        let snapshot = tracker.subscribe().borrow().clone();
        assert_eq!(snapshot.bytes_transferred, 3 * 1024);
        assert_eq!(snapshot.chunks_done, 3);
    }

    #[test]
    fn test_phase_transitions() {
        let tracker = ProgressTracker::new("data.bin", 1, 1);
        let rx = tracker.subscribe();

        tracker.set_phase(TransferPhase::Transferring);
        assert_eq!(rx.borrow().phase, TransferPhase::Transferring);

        tracker.set_phase(TransferPhase::Completed);
        assert_eq!(rx.borrow().phase, TransferPhase::Completed);
    }
}
