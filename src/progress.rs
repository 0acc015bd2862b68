//! Download progress accounting

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Minimum spacing between progress reports
pub const REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Time constant of the speed moving average
const SPEED_TIME_CONSTANT: f64 = 5.0;

/// Snapshot of a running download or install
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgress {
    pub bytes_received: u64,
    pub total_bytes: u64,
    /// 0 to 100
    pub percent: u8,
    /// Smoothed bytes per second
    pub speed: f64,
    pub eta_secs: u64,
    pub operation: String,
}

impl UpdateProgress {
    /// Progress report for a step with no byte count
    pub fn step(operation: &str, percent: u8) -> Self {
        Self {
            bytes_received: 0,
            total_bytes: 0,
            percent: percent.min(100),
            speed: 0.0,
            eta_secs: 0,
            operation: operation.to_string(),
        }
    }
}

/// Turns a stream of byte counts into rate-limited progress reports.
///
/// Time is passed in by the caller so the arithmetic stays testable.
pub struct ProgressTracker {
    total: u64,
    operation: String,
    received: u64,
    speed: f64,
    sample_time: Instant,
    sample_bytes: u64,
    last_report: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total: u64, operation: &str, now: Instant) -> Self {
        Self {
            total,
            operation: operation.to_string(),
            received: 0,
            speed: 0.0,
            sample_time: now,
            sample_bytes: 0,
            last_report: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Record the running byte count.
    ///
    /// Returns a report for the first chunk and then at most once per
    /// [`REPORT_INTERVAL`].
    pub fn record(&mut self, bytes_received: u64, now: Instant) -> Option<UpdateProgress> {
        self.received = self.received.max(bytes_received);
        if self.total > 0 {
            self.received = self.received.min(self.total);
        }
        self.sample(now);

        let due = match self.last_report {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= REPORT_INTERVAL,
        };
        if !due {
            return None;
        }
        self.last_report = Some(now);
        Some(self.snapshot())
    }

    /// Final report once every byte has arrived
    pub fn finish(&mut self, now: Instant) -> UpdateProgress {
        self.sample(now);
        self.last_report = Some(now);
        self.snapshot()
    }

    fn sample(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.sample_time).as_secs_f64();
        if dt <= 0.0 {
            return;
        }

        let instant_speed = (self.received - self.sample_bytes) as f64 / dt;
        if self.sample_bytes == 0 && self.speed == 0.0 {
            self.speed = instant_speed;
        } else {
            let alpha = 1.0 - (-dt / SPEED_TIME_CONSTANT).exp();
            self.speed += alpha * (instant_speed - self.speed);
        }
        self.sample_time = now;
        self.sample_bytes = self.received;
    }

    fn snapshot(&self) -> UpdateProgress {
        let percent = if self.total == 0 {
            0
        } else {
            ((self.received as u128 * 100) / self.total as u128).min(100) as u8
        };
        let remaining = self.total.saturating_sub(self.received);
        let eta_secs = (remaining as f64 / self.speed.max(1.0)).ceil() as u64;

        UpdateProgress {
            bytes_received: self.received,
            total_bytes: self.total,
            percent,
            speed: self.speed,
            eta_secs,
            operation: self.operation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_reported_then_rate_limited() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(1000, "Downloading", start);

        assert!(tracker.record(100, start + Duration::from_millis(10)).is_some());
        assert!(tracker.record(200, start + Duration::from_millis(100)).is_none());
        assert!(tracker.record(300, start + Duration::from_millis(200)).is_none());

        let report = tracker.record(400, start + Duration::from_millis(300)).unwrap();
        assert_eq!(report.bytes_received, 400);
        assert_eq!(report.percent, 40);
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(1000, "Downloading", start);
        let mut last = 0;

        for (i, bytes) in [100u64, 50, 700, 600, 5000].iter().enumerate() {
            let now = start + Duration::from_secs(i as u64 + 1);
            let report = tracker.record(*bytes, now).unwrap();
            assert!(report.bytes_received >= last);
            assert!(report.bytes_received <= report.total_bytes);
            assert!(report.percent <= 100);
            last = report.bytes_received;
        }
        assert_eq!(last, 1000);
    }

    #[test]
    fn test_speed_and_eta() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(10_000, "Downloading", start);

        let report = tracker.record(1_000, start + Duration::from_secs(1)).unwrap();
        assert!((report.speed - 1_000.0).abs() < 1e-6);
        assert_eq!(report.eta_secs, 9);

        // Steady rate keeps the average where it is
        let report = tracker.record(2_000, start + Duration::from_secs(2)).unwrap();
        assert!((report.speed - 1_000.0).abs() < 1e-6);
        assert_eq!(report.eta_secs, 8);
    }

    #[test]
    fn test_eta_with_stalled_transfer() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(500, "Downloading", start);
        let report = tracker.record(0, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.speed, 0.0);
        assert_eq!(report.eta_secs, 500);
    }

    #[test]
    fn test_unknown_total() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(0, "Downloading", start);
        let report = tracker.record(4096, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.percent, 0);
        assert_eq!(report.bytes_received, 4096);
    }
}
