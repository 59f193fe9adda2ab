use std::path::Path;
use std::time::Duration;

use ringstore_common::Endpoint;
use serde::Deserialize;

const DEFAULT_CONN_TIMEOUT_S: f64 = 10.0;
const DEFAULT_PROXY_TIMEOUT_S: f64 = 3.0;
const DEFAULT_BLACKLIST_S: f64 = 30.0;
const DEFAULT_HEALTH_INTERVAL_S: f64 = 1.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: f64,
    /// Time to first byte, and longest stall between body chunks.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout: f64,
    /// Endpoints tried per call; defaults to the number of endpoints.
    #[serde(default)]
    pub max_attempts: Option<usize>,
    #[serde(default = "default_blacklist")]
    pub blacklist_duration: f64,
    #[serde(default)]
    pub zero_copy: bool,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_HEALTH_INTERVAL_S,
        }
    }
}

fn default_conn_timeout() -> f64 {
    DEFAULT_CONN_TIMEOUT_S
}

fn default_proxy_timeout() -> f64 {
    DEFAULT_PROXY_TIMEOUT_S
}

fn default_blacklist() -> f64 {
    DEFAULT_BLACKLIST_S
}

fn default_health_interval() -> f64 {
    DEFAULT_HEALTH_INTERVAL_S
}

/// Validated, typed view of [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub proxy_timeout: Duration,
    pub max_attempts: usize,
    pub blacklist_duration: Duration,
    pub zero_copy: bool,
    pub health_check_interval: Option<Duration>,
}

impl ClientSettings {
    /// Defaults for `endpoint_count` endpoints, without health checks.
    pub fn with_defaults(endpoint_count: usize) -> Self {
        Self {
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONN_TIMEOUT_S),
            proxy_timeout: Duration::from_secs_f64(DEFAULT_PROXY_TIMEOUT_S),
            max_attempts: endpoint_count.max(1),
            blacklist_duration: Duration::from_secs_f64(DEFAULT_BLACKLIST_S),
            zero_copy: false,
            health_check_interval: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| anyhow::anyhow!("{}: {:#}", path.display(), e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("endpoints must contain at least one URL");
        }
        self.parsed_endpoints()?;
        for (name, value) in [
            ("conn_timeout", self.conn_timeout),
            ("proxy_timeout", self.proxy_timeout),
            ("blacklist_duration", self.blacklist_duration),
            ("health_check.interval", self.health_check.interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("{name} must be a positive number of seconds, got {value}");
            }
        }
        if self.max_attempts == Some(0) {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn parsed_endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(self.endpoints.len());
        for raw in &self.endpoints {
            let endpoint = Endpoint::parse(raw)?;
            if endpoints.contains(&endpoint) {
                anyhow::bail!("duplicate endpoint: {}", endpoint);
            }
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs_f64(self.conn_timeout),
            proxy_timeout: Duration::from_secs_f64(self.proxy_timeout),
            max_attempts: self.max_attempts.unwrap_or(self.endpoints.len()).max(1),
            blacklist_duration: Duration::from_secs_f64(self.blacklist_duration),
            zero_copy: self.zero_copy,
            health_check_interval: self
                .health_check
                .enabled
                .then(|| Duration::from_secs_f64(self.health_check.interval)),
        }
    }
}
