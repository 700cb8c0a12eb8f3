//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Upstream proxy definitions
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Cache file for usage statistics
    #[serde(rename = "cache-file")]
    pub cache_file: String,

    /// Resolve and race AAAA records as well
    pub ipv6: bool,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Tunable thresholds and timeouts
    #[serde(flatten)]
    pub tunables: Tunables,
}

/// One upstream proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Proxy IP address
    pub ip: IpAddr,

    /// Proxy port
    pub port: u16,

    /// Domain patterns (regex) always routed through this proxy
    #[serde(default, rename = "fixed-domains")]
    pub fixed_domains: Vec<String>,
}

/// Thresholds and timeouts consumed by the race connector and the
/// diagnostics engine. All durations are milliseconds unless named otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Absolute deadline for a race session to commit a winner
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,

    /// Per-candidate idle window before verification or failure
    #[serde(rename = "idle-timeout-ms")]
    pub idle_timeout_ms: u64,

    /// Grace period after which a lone direct candidate is questioned
    #[serde(rename = "good-socket-timeout-ms")]
    pub good_socket_timeout_ms: u64,

    /// Not-exactly-good counter value past which a domain goes proxy-only
    #[serde(rename = "not-good-limit")]
    pub not_good_limit: f64,

    /// Retries per candidate that failed before producing data
    #[serde(rename = "max-retry")]
    pub max_retry: u32,

    /// Delay before a candidate retry
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Cost penalty applied to direct paths when proxies are racing.
    /// Direct paths must beat proxies by more than this margin to win.
    #[serde(rename = "proxy-cost-bonus-ms")]
    pub proxy_cost_bonus_ms: u64,

    /// Multiplier on post-flush latency in the weighted cost
    #[serde(rename = "action-cost-rate")]
    pub action_cost_rate: f64,

    /// Debounce window between idle-timeout verification probes
    #[serde(rename = "idle-reverify-wait-ms")]
    pub idle_reverify_wait_ms: u64,

    /// Packet-loss ceiling for a direct candidate to stay in the list
    #[serde(rename = "max-loss-pct")]
    pub max_loss_pct: f32,

    /// Latency below which a zero-loss candidate is classified good
    #[serde(rename = "good-latency-ms")]
    pub good_latency_ms: u32,

    /// Expose the first resolved IP before ping results arrive
    #[serde(rename = "ping-async")]
    pub ping_async: bool,

    /// Per-echo ping timeout, seconds
    #[serde(rename = "ping-timeout-secs")]
    pub ping_timeout_secs: u64,

    /// Destinations probed per refresh batch
    #[serde(rename = "ping-batch-count")]
    pub ping_batch_count: usize,

    /// DNS lookup timeout, applied only when proxies are configured
    #[serde(rename = "dns-timeout-ms")]
    pub dns_timeout_ms: u64,

    /// Hours of inactivity before a cached domain decays
    #[serde(rename = "cache-domain-life-hours")]
    pub cache_domain_life_hours: u32,

    /// Background TTL refresh cadence
    #[serde(rename = "refresh-interval-ms")]
    pub refresh_interval_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            connect_timeout_ms: 15_000,
            idle_timeout_ms: 4_000,
            good_socket_timeout_ms: 300,
            not_good_limit: 3.5,
            max_retry: 3,
            retry_delay_ms: 300,
            proxy_cost_bonus_ms: 30,
            action_cost_rate: 3.0,
            idle_reverify_wait_ms: 5_000,
            max_loss_pct: 50.0,
            good_latency_ms: 150,
            ping_async: true,
            ping_timeout_secs: 10,
            ping_batch_count: 50,
            dns_timeout_ms: 10_000,
            cache_domain_life_hours: 30 * 24,
            refresh_interval_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("listen port must be non-zero"));
        }
        for up in &self.upstreams {
            if up.port == 0 {
                return Err(Error::config(format!("upstream {} has port 0", up.ip)));
            }
            for pattern in &up.fixed_domains {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::config(format!("bad fixed-domain pattern {:?}: {}", pattern, e))
                })?;
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8008,
            upstreams: Vec::new(),
            cache_file: "./racegate-cache.bin".to_string(),
            ipv6: false,
            log_level: Some("info".to_string()),
            tunables: Tunables::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8008);
        assert_eq!(config.tunables.proxy_cost_bonus_ms, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
port: 9100
upstreams:
  - ip: 10.20.0.2
    port: 8080
    fixed-domains: [".*\\.internal\\.corp"]
proxy-cost-bonus-ms: 45
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.tunables.proxy_cost_bonus_ms, 45);
        // untouched tunables keep defaults
        assert_eq!(config.tunables.max_retry, 3);
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let yaml = r#"
upstreams:
  - ip: 10.0.0.1
    port: 8080
    fixed-domains: ["("]
"#;
        assert!(Config::from_str(yaml).is_err());
    }
}
