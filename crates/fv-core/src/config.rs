use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide settings that are not part of the persisted `Provider`/`Instance`
/// rows (spec §3): SSH pool limits, sweeper cadences, default task timeouts.
/// Loaded from TOML, with env var overrides for the handful of settings an
/// operator commonly wants to tweak without editing the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub ssh_connect_timeout_secs: u64,
    pub ssh_execute_timeout_secs: u64,
    pub ssh_pool_idle_evict_secs: u64,
    pub http_transport_idle_evict_secs: u64,
    pub http_transport_sweep_interval_secs: u64,
    pub reservation_ttl_secs: u64,
    pub reservation_sweep_interval_secs: u64,
    pub default_create_timeout_secs: u64,
    pub batch_queue_capacity: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ssh_connect_timeout_secs: 30,
            ssh_execute_timeout_secs: 300,
            ssh_pool_idle_evict_secs: 30 * 60,
            http_transport_idle_evict_secs: 30 * 60,
            http_transport_sweep_interval_secs: 5 * 60,
            reservation_ttl_secs: 60 * 60,
            reservation_sweep_interval_secs: 10 * 60,
            default_create_timeout_secs: 1800,
            batch_queue_capacity: 500,
            log_format: LogFormat::Text,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply the handful of env var overrides this layer supports (env wins
    /// over file, file wins over built-in default).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("FLEETVISOR_LOG_FORMAT") {
            if v.eq_ignore_ascii_case("json") {
                self.log_format = LogFormat::Json;
            } else if v.eq_ignore_ascii_case("text") {
                self.log_format = LogFormat::Text;
            }
        }
        self
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_execute_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_execute_timeout_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.ssh_connect_timeout_secs, 30);
        assert_eq!(cfg.ssh_execute_timeout_secs, 300);
        assert_eq!(cfg.reservation_ttl_secs, 3600);
        assert_eq!(cfg.default_create_timeout_secs, 1800);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = DaemonConfig::from_toml_str("ssh_execute_timeout_secs = 600\n").unwrap();
        assert_eq!(cfg.ssh_execute_timeout_secs, 600);
        assert_eq!(cfg.ssh_connect_timeout_secs, 30);
    }

    #[test]
    fn env_override_switches_log_format() {
        // SAFETY: test-only, single-threaded within this test process run.
        unsafe {
            std::env::set_var("FLEETVISOR_LOG_FORMAT", "json");
        }
        let cfg = DaemonConfig::default().apply_env_overrides();
        assert_eq!(cfg.log_format, LogFormat::Json);
        unsafe {
            std::env::remove_var("FLEETVISOR_LOG_FORMAT");
        }
    }
}
