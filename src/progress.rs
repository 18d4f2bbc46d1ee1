use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub total: usize,
    pub successful: usize,
    pub elapsed: Duration,
    pub remaining_estimate: Duration,
    /// Percent of processed segments that matched.
    pub success_rate: f64,
    pub rate_per_second: f64,
}

/// Processed / matched counters plus throughput.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    processed: usize,
    successful: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self::starting_at(total, Instant::now())
    }

    pub fn starting_at(total: usize, started: Instant) -> Self {
        Self {
            total,
            processed: 0,
            successful: 0,
            started,
        }
    }

    pub fn update(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.successful += 1;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        };
        let remaining = if rate > 0.0 {
            Duration::from_secs_f64(self.total.saturating_sub(self.processed) as f64 / rate)
        } else {
            Duration::ZERO
        };
        let success_rate = if self.processed > 0 {
            self.successful as f64 / self.processed as f64 * 100.0
        } else {
            0.0
        };

        ProgressSnapshot {
            processed: self.processed,
            total: self.total,
            successful: self.successful,
            elapsed,
            remaining_estimate: remaining,
            success_rate,
            rate_per_second: rate,
        }
    }

    /// One-line summary, e.g. for the end of a run.
    pub fn format_progress(&self) -> String {
        self.snapshot().to_string()
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let percent = if self.total > 0 {
            self.processed as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "Progress: {}/{} segments ({:.1}%) [{:.1}s elapsed, ~{:.1}s remaining] Success rate: {:.1}%",
            self.processed,
            self.total,
            percent,
            self.elapsed.as_secs_f64(),
            self.remaining_estimate.as_secs_f64(),
            self.success_rate,
        )
    }
}
