//! Background health checks.
//!
//! One task per endpoint fetches `{endpoint}/.conf` on a fixed interval. A
//! probe succeeds when the store answers and its configuration enables
//! query-by-path; successes are heartbeats for a [`PhiAccrualDetector`], and
//! detector state changes are pushed into the [`HealthTracker`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use ringstore_common::Endpoint;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::detector::PhiAccrualDetector;
use crate::health::HealthTracker;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("by_path_enabled is not set in the store configuration")]
    ByPathDisabled,
}

fn by_path_enabled_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches both the JSON and the INI configuration formats.
    RE.get_or_init(|| {
        Regex::new(r#"(?i)^\s*"?by_path_enabled[":=]+\s*(1|true)[",]*\s*$"#)
            .expect("static regex is valid")
    })
}

/// Whether the store configuration has query-by-path enabled.
pub fn conf_enables_by_path(conf: &str) -> bool {
    conf.lines().any(|line| by_path_enabled_re().is_match(line))
}

/// Fetch and check an endpoint's configuration once.
pub async fn probe(client: &Client, endpoint: &Endpoint) -> Result<(), ProbeError> {
    let resp = client
        .get(endpoint.conf_url())
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(ProbeError::Status(resp.status().as_u16()));
    }
    let body = resp.text().await?;
    if conf_enables_by_path(&body) {
        Ok(())
    } else {
        Err(ProbeError::ByPathDisabled)
    }
}

/// Running health-check tasks; dropping the handle stops them.
pub struct HealthMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn spawn(tracker: Arc<HealthTracker>, client: Client, interval: Duration) -> Self {
        let tasks = tracker
            .endpoints()
            .cloned()
            .map(|endpoint| {
                let tracker = Arc::clone(&tracker);
                let client = client.clone();
                tokio::spawn(monitoring_loop(tracker, client, endpoint, interval))
            })
            .collect();
        Self { tasks }
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn monitoring_loop(
    tracker: Arc<HealthTracker>,
    client: Client,
    endpoint: Endpoint,
    interval: Duration,
) {
    let mut detector = PhiAccrualDetector::default();
    // None until the first transition, so the initial state is always pushed.
    let mut operational: Option<bool> = None;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(endpoint = %endpoint, interval_ms = interval.as_millis() as u64, "Health monitor started");

    loop {
        ticker.tick().await;
        match probe(&client, &endpoint).await {
            Ok(()) => detector.heartbeat(Instant::now()),
            Err(e) => {
                match &e {
                    ProbeError::ByPathDisabled => {
                        warn!(endpoint = %endpoint, error = %e, "Store configuration is invalid")
                    }
                    _ => debug!(endpoint = %endpoint, error = %e, "Health probe failed"),
                }
                // A successful probe never marks the endpoint down, even when
                // the detector lacks history.
                if !detector.is_alive(Instant::now()) && operational != Some(false) {
                    tracker.mark_down(&endpoint);
                    operational = Some(false);
                }
            }
        }
        if detector.is_alive(Instant::now()) && operational != Some(true) {
            tracker.mark_up(&endpoint);
            operational = Some(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_json() {
        let conf = r#"{
    "general": {
        "ring": "MyRing",
        "by_path_enabled": true,
        "by_path_cos": 0
    }
}"#;
        assert!(conf_enables_by_path(conf));
        assert!(conf_enables_by_path("{\n\"by_path_enabled\": 1,\n}"));
    }

    #[test]
    fn test_conf_ini() {
        assert!(conf_enables_by_path("[general]\nby_path_enabled=1\n"));
        assert!(conf_enables_by_path("  by_path_enabled=TRUE  "));
    }

    #[test]
    fn test_conf_disabled() {
        assert!(!conf_enables_by_path("by_path_enabled=0"));
        assert!(!conf_enables_by_path("{\"by_path_enabled\": false}"));
        assert!(!conf_enables_by_path(""));
        assert!(!conf_enables_by_path("# by_path_enabled=1"));
    }
}
