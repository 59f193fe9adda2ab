//! Phi accrual failure detector (Hayashibara et al.).
//!
//! Heartbeats come from successful health probes. `phi` grows with the time
//! since the last heartbeat relative to the mean inter-arrival time, using
//! an exponential distribution. With too little history the detector reports
//! the endpoint as dead.

use std::collections::VecDeque;

use tokio::time::Instant;

const MAX_SAMPLE_SIZE: usize = 1000;
/// 1 ~ 10% false positives, 2 ~ 1%, 3 ~ 0.1%.
const DEFAULT_THRESHOLD: f64 = 2.0;
const MIN_PROBABILITY: f64 = 1e-128;

#[derive(Debug, Clone)]
pub struct PhiAccrualDetector {
    intervals: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
    mean: Option<f64>,
    threshold: f64,
}

impl Default for PhiAccrualDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl PhiAccrualDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            intervals: VecDeque::new(),
            last_heartbeat: None,
            mean: None,
            threshold,
        }
    }

    pub fn heartbeat(&mut self, now: Instant) {
        if let Some(last) = self.last_heartbeat {
            let interval = now.saturating_duration_since(last).as_secs_f64();
            self.intervals.push_back(interval);
            if self.intervals.len() > MAX_SAMPLE_SIZE {
                self.intervals.pop_front();
            }
            if self.intervals.len() > 1 {
                self.mean = Some(self.intervals.iter().sum::<f64>() / self.intervals.len() as f64);
            }
        }
        self.last_heartbeat = Some(now);
    }

    pub fn phi(&self, now: Instant) -> f64 {
        let (Some(mean), Some(last)) = (self.mean, self.last_heartbeat) else {
            return self.threshold + 1.0;
        };
        if mean <= 0.0 {
            // Heartbeats closer together than the clock resolution.
            return if now > last { f64::INFINITY } else { 0.0 };
        }
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let probability = (-elapsed / mean).exp().max(MIN_PROBABILITY);
        -probability.log10()
    }

    pub fn is_alive(&self, now: Instant) -> bool {
        self.phi(now) < self.threshold
    }
}
