use std::time::{Duration, Instant};

use serde::Serialize;

const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Segment counters of one job.
///
/// Only terminal segment outcomes are recorded: a segment that is retried is
/// counted once, when it finally completes or fails.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    completed: u64,
    failed: u64,

    downloaded_bytes: u64,
    /// Bytes per second
    speed: f64,
    sampled_at: Instant,
    sampled_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub percent: f64,
    /// Bytes per second
    pub speed: f64,
    pub eta: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self::resume(total, 0, 0, 0)
    }

    /// Continue counting from already settled segments.
    pub fn resume(total: u64, completed: u64, failed: u64, downloaded_bytes: u64) -> Self {
        Self {
            total,
            completed,
            failed,
            downloaded_bytes,
            speed: 0.,
            sampled_at: Instant::now(),
            sampled_bytes: downloaded_bytes,
        }
    }

    pub fn record_completed(&mut self, bytes: u64) {
        self.record_completed_at(bytes, Instant::now());
    }

    pub fn record_completed_at(&mut self, bytes: u64, now: Instant) {
        self.completed += 1;
        self.downloaded_bytes += bytes;

        let elapsed = now.saturating_duration_since(self.sampled_at);
        if elapsed >= SPEED_SAMPLE_INTERVAL {
            let bytes = self.downloaded_bytes - self.sampled_bytes;
            self.speed = bytes as f64 / elapsed.as_secs_f64();
            self.sampled_at = now;
            self.sampled_bytes = self.downloaded_bytes;
        }
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.
        } else {
            self.completed as f64 / self.total as f64 * 100.
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Remaining segments times the average segment size, at the current speed.
    pub fn eta(&self) -> Option<Duration> {
        if self.speed <= 0. || self.completed == 0 {
            return None;
        }

        let remaining = self.total.saturating_sub(self.completed + self.failed);
        let average = self.downloaded_bytes as f64 / self.completed as f64;
        Duration::try_from_secs_f64(remaining as f64 * average / self.speed).ok()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            percent: self.percent(),
            speed: self.speed,
            eta: self.eta(),
        }
    }
}

/// `1.50 MB/s`
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

pub fn format_size(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1. {
        return "0 B".to_string();
    }
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024. && unit < UNITS.len() - 1 {
        value /= 1024.;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// `45s`, `5m 30s`, `2h 5m`
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, secs % 3600 / 60)
    }
}
