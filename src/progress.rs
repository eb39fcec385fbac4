// src/progress.rs

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// A point-in-time view of a transfer.
///
/// `downloaded` includes bytes written by earlier, interrupted attempts;
/// `speed` only counts the bytes of the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes on disk for this destination, cumulative across attempts.
    pub downloaded: u64,
    /// Expected final size, 0 when the server did not say.
    pub total: u64,
    /// Bytes per second for the current session.
    pub speed: f64,
    /// 0..=100, 0 when `total` is unknown.
    pub percent: f64,
    /// Seconds remaining, 0 when the speed is 0.
    pub eta: f64,
}

impl Progress {
    /// Snapshot of a job that has not produced any samples yet.
    pub fn starting_at(downloaded: u64) -> Self {
        Self {
            downloaded,
            ..Self::default()
        }
    }
}

/// Callback invoked with every progress sample.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Tracks one session of a transfer and turns it into [`Progress`] samples.
#[derive(Debug)]
pub(crate) struct ProgressMeter {
    resumed_from: u64,
    downloaded: u64,
    total: u64,
    started: Instant,
}

impl ProgressMeter {
    pub(crate) fn new(resumed_from: u64, total: u64) -> Self {
        Self {
            resumed_from,
            downloaded: resumed_from,
            total,
            started: Instant::now(),
        }
    }

    pub(crate) fn record(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;
    }

    pub(crate) fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub(crate) fn snapshot(&self) -> Progress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let session_bytes = self.downloaded - self.resumed_from;
        let speed = if elapsed > 0.0 {
            session_bytes as f64 / elapsed
        } else {
            0.0
        };
        let percent = if self.total > 0 {
            (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(self.downloaded);
        let eta = if speed > 0.0 && remaining > 0 {
            remaining as f64 / speed
        } else {
            0.0
        };

        Progress {
            downloaded: self.downloaded,
            total: self.total,
            speed,
            percent,
            eta,
        }
    }
}
