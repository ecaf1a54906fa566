//! Per-connection call statistics used for connection preference.

use std::time::Duration;

const RTT_ALPHA: f64 = 0.2;
/// Assumed round-trip before the first call completes.
const DEFAULT_RTT_MS: f64 = 50.0;
const CONSECUTIVE_ERROR_PENALTY_MS: f64 = 250.0;

#[derive(Debug, Clone, Default)]
pub struct CallStats {
    smoothed_rtt_ms: Option<f64>,
    consecutive_errors: u32,
    total_errors: u64,
    total_calls: u64,
}

impl CallStats {
    pub fn record_success(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        self.smoothed_rtt_ms = Some(match self.smoothed_rtt_ms {
            Some(prev) => prev + RTT_ALPHA * (sample - prev),
            None => sample,
        });
        self.consecutive_errors = 0;
        self.total_calls += 1;
    }

    pub fn record_error(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.total_errors += 1;
        self.total_calls += 1;
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt_ms
            .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_calls as f64
        }
    }

    /// Lower is better. Combines smoothed RTT with recent and lifetime errors.
    pub fn score(&self) -> f64 {
        let rtt = self.smoothed_rtt_ms.unwrap_or(DEFAULT_RTT_MS);
        rtt * (1.0 + self.error_rate())
            + CONSECUTIVE_ERROR_PENALTY_MS * self.consecutive_errors as f64
    }
}
