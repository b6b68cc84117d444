//! Throughput sampling and stall detection for a running transfer.

use std::time::{Duration, Instant};

/// Default sampling window for throughput: 1 s.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ThroughputSampler
// ---------------------------------------------------------------------------

/// Measures instantaneous throughput over a fixed sampling window.
///
/// Each time at least one window has elapsed since the last sample, the
/// speed is recomputed as `Δbytes / Δtime` and the window restarts. Between
/// samples the previous speed is kept.
#[derive(Debug)]
pub struct ThroughputSampler {
    window: Duration,
    window_start: Instant,
    window_start_bytes: u64,
    speed_bps: f64,
}

impl ThroughputSampler {
    /// Creates a sampler whose first window starts at `now`.
    ///
    /// If `window` is `None`, defaults to 1 s.
    pub fn new(window: Option<Duration>, now: Instant) -> Self {
        Self {
            window: window.unwrap_or(DEFAULT_WINDOW),
            window_start: now,
            window_start_bytes: 0,
            speed_bps: 0.0,
        }
    }

    /// Records the cumulative byte count at `now`.
    ///
    /// Returns the new speed when a window closed, `None` otherwise.
    pub fn record(&mut self, total_bytes: u64, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let delta = total_bytes.saturating_sub(self.window_start_bytes);
        self.speed_bps = delta as f64 / elapsed.as_secs_f64();
        self.window_start = now;
        self.window_start_bytes = total_bytes;
        Some(self.speed_bps)
    }

    /// Estimated seconds to transfer `remaining_bytes` at the last speed.
    ///
    /// Returns `None` until a non-zero speed has been measured.
    pub fn eta_seconds(&self, remaining_bytes: u64) -> Option<f64> {
        if self.speed_bps <= 0.0 {
            return None;
        }
        Some(remaining_bytes as f64 / self.speed_bps)
    }
}

// ---------------------------------------------------------------------------
// StallDetector
// ---------------------------------------------------------------------------

/// Flags a transfer whose byte offset stopped moving.
///
/// A transfer is stalled when some bytes were already sent and no progress
/// arrived for longer than the threshold. Stalling is advisory only.
#[derive(Debug)]
pub struct StallDetector {
    threshold: Duration,
    last_progress: Instant,
    bytes_seen: bool,
    stalled: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_progress: now,
            bytes_seen: false,
            stalled: false,
        }
    }

    /// Notes byte progress at `now`; clears any stall.
    pub fn on_progress(&mut self, now: Instant) {
        self.last_progress = now;
        self.bytes_seen = true;
        self.stalled = false;
    }

    /// Re-evaluates the stall flag at `now`.
    ///
    /// Returns `true` if the flag changed.
    pub fn check(&mut self, now: Instant) -> bool {
        let idle = now.saturating_duration_since(self.last_progress);
        let stalled = self.bytes_seen && idle > self.threshold;
        let changed = stalled != self.stalled;
        self.stalled = stalled;
        changed
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}
