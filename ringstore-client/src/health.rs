//! Endpoint health tracking.
//!
//! Each endpoint carries a blacklist deadline (milliseconds since the tracker
//! was created, `0` when healthy) and a probe flag set by the health monitor.
//! Both are plain atomics: readers never wait on writers, and a slightly
//! stale view is acceptable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ringstore_common::Endpoint;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What went wrong on an attempt, as far as endpoint health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connect failure, reset, timeout or other I/O error.
    Transport,
    /// The store answered with a 5xx.
    ServerError,
    /// The store answered with a 4xx: a semantic result, not a health signal.
    ClientError,
}

impl FailureClass {
    pub fn blacklists(self) -> bool {
        !matches!(self, FailureClass::ClientError)
    }
}

struct EndpointState {
    endpoint: Endpoint,
    blacklisted_until_ms: AtomicU64,
    probed_down: AtomicBool,
}

/// Snapshot of one endpoint's health, for diagnostics.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub endpoint: Endpoint,
    pub blacklisted_for: Option<Duration>,
    pub probed_down: bool,
}

impl EndpointStatus {
    pub fn is_healthy(&self) -> bool {
        self.blacklisted_for.is_none() && !self.probed_down
    }
}

pub struct HealthTracker {
    states: Vec<EndpointState>,
    /// Position in `states`; the first occurrence wins for duplicates.
    index: HashMap<Endpoint, usize>,
    blacklist_duration: Duration,
    epoch: Instant,
}

impl HealthTracker {
    pub fn new(endpoints: Vec<Endpoint>, blacklist_duration: Duration) -> Self {
        let mut index = HashMap::with_capacity(endpoints.len());
        for (i, endpoint) in endpoints.iter().enumerate() {
            index.entry(endpoint.clone()).or_insert(i);
        }
        Self {
            index,
            states: endpoints
                .into_iter()
                .map(|endpoint| EndpointState {
                    endpoint,
                    blacklisted_until_ms: AtomicU64::new(0),
                    probed_down: AtomicBool::new(false),
                })
                .collect(),
            blacklist_duration,
            epoch: Instant::now(),
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.states.iter().map(|s| &s.endpoint)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn state(&self, endpoint: &Endpoint) -> Option<&EndpointState> {
        self.index.get(endpoint).map(|&i| &self.states[i])
    }

    /// Remaining blacklist time; clears an expired deadline on the way.
    fn blacklist_remaining(&self, state: &EndpointState, now_ms: u64) -> Option<Duration> {
        let until = state.blacklisted_until_ms.load(Ordering::Acquire);
        if until == 0 {
            return None;
        }
        if now_ms < until {
            return Some(Duration::from_millis(until - now_ms));
        }
        // Lazy expiry. A concurrent re-arm wins the exchange.
        if state
            .blacklisted_until_ms
            .compare_exchange(until, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(endpoint = %state.endpoint, "Blacklist window expired");
        }
        None
    }

    fn is_healthy_at(&self, state: &EndpointState, now_ms: u64) -> bool {
        self.blacklist_remaining(state, now_ms).is_none() && !state.probed_down.load(Ordering::Acquire)
    }

    /// Endpoints in dispatch order: healthy ones first, then the rest as a
    /// last resort. Configuration order is kept within each group.
    pub fn candidates(&self) -> Vec<Endpoint> {
        let now_ms = self.now_ms();
        let (healthy, degraded): (Vec<&EndpointState>, Vec<&EndpointState>) =
            self.states.iter().partition(|s| self.is_healthy_at(s, now_ms));
        healthy
            .into_iter()
            .chain(degraded)
            .map(|s| s.endpoint.clone())
            .collect()
    }

    pub fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        let now_ms = self.now_ms();
        self.state(endpoint).is_some_and(|s| self.is_healthy_at(s, now_ms))
    }

    /// Record a failed attempt. Failures that indicate an unhealthy endpoint
    /// re-arm its blacklist window to `now + blacklist_duration`.
    pub fn report_failure(&self, endpoint: &Endpoint, class: FailureClass) {
        if !class.blacklists() {
            return;
        }
        let Some(state) = self.state(endpoint) else {
            return;
        };
        // +1 keeps the deadline non-zero even at the tracker's epoch.
        let until = self.now_ms() + self.blacklist_duration.as_millis() as u64 + 1;
        let previous = state.blacklisted_until_ms.swap(until, Ordering::AcqRel);
        if previous == 0 {
            warn!(
                endpoint = %endpoint,
                class = ?class,
                duration_ms = self.blacklist_duration.as_millis() as u64,
                "Endpoint blacklisted"
            );
        }
    }

    pub fn report_success(&self, endpoint: &Endpoint) {
        if let Some(state) = self.state(endpoint) {
            if state.blacklisted_until_ms.swap(0, Ordering::AcqRel) != 0 {
                info!(endpoint = %endpoint, "Endpoint back in rotation");
            }
        }
    }

    /// Called by the health monitor when probes say the endpoint is gone.
    pub fn mark_down(&self, endpoint: &Endpoint) {
        if let Some(state) = self.state(endpoint) {
            if !state.probed_down.swap(true, Ordering::AcqRel) {
                warn!(endpoint = %endpoint, "Endpoint is down or misconfigured");
            }
        }
    }

    pub fn mark_up(&self, endpoint: &Endpoint) {
        if let Some(state) = self.state(endpoint) {
            if state.probed_down.swap(false, Ordering::AcqRel) {
                info!(endpoint = %endpoint, "Endpoint is up");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let now_ms = self.now_ms();
        self.states
            .iter()
            .map(|s| EndpointStatus {
                endpoint: s.endpoint.clone(),
                blacklisted_for: self.blacklist_remaining(s, now_ms),
                probed_down: s.probed_down.load(Ordering::Acquire),
            })
            .collect()
    }
}
