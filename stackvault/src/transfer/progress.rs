//! Task-level progress tracking for restore runs.
//!
//! Progress is reported at batch boundaries: processed count, elapsed time
//! and an ETA extrapolated from the throughput so far.

use std::fmt;
use std::time::{Duration, Instant};

/// Progress information at one point of a run
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    /// Tasks finished so far
    pub processed: usize,

    /// Total number of tasks
    pub total: usize,

    pub succeeded: usize,
    pub failed: usize,

    pub elapsed: Duration,

    /// Estimated time remaining; `None` until a task has finished
    pub eta: Option<Duration>,

    /// Percentage complete (0-100)
    pub percent_complete: f64,
}

impl TaskProgress {
    /// Check if all tasks are done
    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({:.1}%), elapsed {}",
            self.processed,
            self.total,
            self.percent_complete,
            format_duration(self.elapsed.as_secs())
        )?;
        if let Some(eta) = self.eta {
            write!(f, ", ETA {}", format_duration(eta.as_secs()))?;
        }
        Ok(())
    }
}

/// Progress tracker with throughput-based ETA
pub struct ProgressTracker {
    start_time: Instant,
    total: usize,
    succeeded: usize,
    failed: usize,
}

impl ProgressTracker {
    /// Create a new progress tracker
    pub fn new(total: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total,
            succeeded: 0,
            failed: 0,
        }
    }

    /// Account for a finished batch and return the updated progress
    pub fn record_batch(&mut self, succeeded: usize, failed: usize) -> TaskProgress {
        self.succeeded += succeeded;
        self.failed += failed;
        self.progress_at(self.elapsed())
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn progress(&self) -> TaskProgress {
        self.progress_at(self.elapsed())
    }

    fn progress_at(&self, elapsed: Duration) -> TaskProgress {
        let processed = self.succeeded + self.failed;
        let remaining = self.total.saturating_sub(processed);
        let eta = (processed > 0).then(|| {
            let nanos = elapsed.as_nanos() * remaining as u128 / processed as u128;
            Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
        });

        TaskProgress {
            processed,
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            elapsed,
            eta,
            percent_complete: if self.total > 0 {
                (processed as f64 / self.total as f64) * 100.0
            } else {
                100.0
            },
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
