use std::time::{Duration, Instant};

use crate::config::TransferLimitsConfig;

/// Bandwidth and inactivity limits evaluated on every dispatch tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub min_speed: u64,
    pub min_speed_time: Duration,
    pub min_average_speed: u64,
    pub max_inactivity: Duration,
}

impl TransferLimits {
    pub fn from_config(cfg: &TransferLimitsConfig) -> Self {
        Self {
            min_speed: cfg.min_speed,
            min_speed_time: Duration::from_secs(cfg.min_speed_time_secs),
            min_average_speed: cfg.min_average_speed,
            max_inactivity: Duration::from_secs(cfg.max_inactivity_time_secs),
        }
    }

    /// Feed the current byte count; returns a reason when the transfer should be failed.
    pub fn evaluate(&self, watch: &mut ProgressWatch, bytes: u64, now: Instant) -> Option<String> {
        if bytes > watch.last_bytes {
            watch.last_bytes = bytes;
            watch.last_change = now;
        }

        if !self.max_inactivity.is_zero()
            && now.saturating_duration_since(watch.last_change) >= self.max_inactivity
        {
            return Some(format!(
                "no data transferred for {} seconds",
                self.max_inactivity.as_secs()
            ));
        }

        if self.min_speed_time.is_zero() {
            return None;
        }

        let elapsed = now.saturating_duration_since(watch.started);
        if self.min_average_speed > 0 && elapsed >= self.min_speed_time {
            let avg = bytes as f64 / elapsed.as_secs_f64();
            if avg < self.min_average_speed as f64 {
                return Some(format!(
                    "average bandwidth {:.0} B/s below minimum {} B/s",
                    avg, self.min_average_speed
                ));
            }
        }

        if self.min_speed > 0 {
            let window = now.saturating_duration_since(watch.window_start);
            if window >= self.min_speed_time {
                let moved = bytes.saturating_sub(watch.window_bytes);
                let rate = moved as f64 / window.as_secs_f64();
                if rate < self.min_speed as f64 {
                    return Some(format!(
                        "bandwidth {:.0} B/s below minimum {} B/s for {} seconds",
                        rate,
                        self.min_speed,
                        self.min_speed_time.as_secs()
                    ));
                }
                watch.window_start = now;
                watch.window_bytes = bytes;
            }
        }
        None
    }
}

/// Per-transfer progress history kept by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ProgressWatch {
    started: Instant,
    last_bytes: u64,
    last_change: Instant,
    window_start: Instant,
    window_bytes: u64,
}

impl ProgressWatch {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_bytes: 0,
            last_change: now,
            window_start: now,
            window_bytes: 0,
        }
    }
}
