//! HTTP transport registry (spec §4.1 — the native-HTTPS half of C7).
//!
//! Mirrors the SSH pool: a `reqwest::Client` is registered at provider
//! connect and unregistered at disconnect; idle entries are pruned by a
//! periodic sweep (every 5 minutes per spec) rather than on every access,
//! since `reqwest::Client` has no cheap liveness probe of its own.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fv_core::error::CoreError;
use tracing::{debug, info};

struct TransportEntry {
    client: reqwest::Client,
    base_url: String,
    last_access: Instant,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub idle_evict_after: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_evict_after: Duration::from_secs(5 * 60),
            accept_invalid_certs: false,
        }
    }
}

pub struct TransportRegistry {
    entries: Mutex<HashMap<String, TransportEntry>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider_id: &str, base_url: String, config: &TransportConfig) -> Result<(), CoreError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|_| CoreError::redacted("http_transport", "failed to build client"))?;
        let mut guard = self.entries.lock().expect("transport registry mutex poisoned");
        guard.insert(
            provider_id.to_string(),
            TransportEntry {
                client,
                base_url,
                last_access: Instant::now(),
            },
        );
        info!(provider_id, "http transport registered");
        Ok(())
    }

    pub fn unregister(&self, provider_id: &str) {
        let mut guard = self.entries.lock().expect("transport registry mutex poisoned");
        guard.remove(provider_id);
    }

    /// Fetch the client and base URL for a provider, bumping its last-access
    /// time, or `NotConnected` if it was never registered (or was pruned).
    pub fn get(&self, provider_id: &str) -> Result<(reqwest::Client, String), CoreError> {
        let mut guard = self.entries.lock().expect("transport registry mutex poisoned");
        let entry = guard
            .get_mut(provider_id)
            .ok_or_else(|| CoreError::NotConnected {
                provider_id: provider_id.to_string(),
            })?;
        entry.last_access = Instant::now();
        Ok((entry.client.clone(), entry.base_url.clone()))
    }

    pub fn is_registered(&self, provider_id: &str) -> bool {
        let guard = self.entries.lock().expect("transport registry mutex poisoned");
        guard.contains_key(provider_id)
    }

    pub fn sweep_idle(&self, config: &TransportConfig) {
        let mut guard = self.entries.lock().expect("transport registry mutex poisoned");
        let before = guard.len();
        guard.retain(|provider_id, entry| {
            let fresh = entry.last_access.elapsed() < config.idle_evict_after;
            if !fresh {
                debug!(provider_id, "evicting idle http transport");
            }
            fresh
        });
        if guard.len() != before {
            info!(evicted = before - guard.len(), "http transport sweep complete");
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_without_register_is_not_connected() {
        let registry = TransportRegistry::new();
        let err = registry.get("p1").unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }

    #[test]
    fn register_then_unregister_clears_entry() {
        let registry = TransportRegistry::new();
        registry
            .register("p1", "https://10.0.0.1:8006".into(), &TransportConfig::default())
            .unwrap();
        assert!(registry.is_registered("p1"));
        registry.unregister("p1");
        assert!(!registry.is_registered("p1"));
    }
}
