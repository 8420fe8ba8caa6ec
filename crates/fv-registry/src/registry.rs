//! Provider handle registry (spec §4.7): a singleton table of live adapter
//! handles keyed by `provider_id`, backed by one `RwLock<HashMap<...>>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::{Provider, ProviderType};
use fv_lifecycle::ProviderDirectory;
use fv_provider::adapters::{docker::DockerAdapter, lxd::LxdAdapter, proxmox::ProxmoxAdapter};
use fv_provider::http_transport::TransportRegistry;
use fv_provider::{NodeConfig, ProviderAdapter};
use fv_ssh::SshPool;
use fv_storage::Storage;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct Handle {
    adapter: Arc<dyn ProviderAdapter>,
    node: NodeConfig,
    /// Flipped by the periodic health probe (spec §11 "Provider health probe
    /// loop"); never touches instance status, just this registry's own view
    /// of whether the provider is currently reachable.
    reachable: AtomicBool,
}

/// `LoadProvider`/`GetProviderByID`/`ReloadProvider` (spec §4.7).
pub struct ProviderRegistry<S: Storage> {
    storage: Arc<S>,
    ssh: Arc<SshPool>,
    transports: Arc<TransportRegistry>,
    handles: RwLock<HashMap<String, Handle>>,
}

impl<S: Storage> ProviderRegistry<S> {
    pub fn new(storage: Arc<S>, ssh: Arc<SshPool>, transports: Arc<TransportRegistry>) -> Self {
        Self { storage, ssh, transports, handles: RwLock::new(HashMap::new()) }
    }

    fn build_adapter(&self, provider_type: ProviderType) -> Arc<dyn ProviderAdapter> {
        match provider_type {
            ProviderType::Docker => Arc::new(DockerAdapter::new(self.ssh.clone())),
            ProviderType::Lxd | ProviderType::Incus => Arc::new(LxdAdapter::new(provider_type, self.ssh.clone())),
            ProviderType::Proxmox => Arc::new(ProxmoxAdapter::new(self.ssh.clone(), self.transports.clone())),
        }
    }

    /// Connects to the host named by `provider` and stores its handle,
    /// instantiating whichever adapter matches `provider.provider_type`.
    pub async fn load_provider(&self, provider: &Provider) -> Result<(), CoreError> {
        let adapter = self.build_adapter(provider.provider_type);
        let node = node_config_for(provider);
        adapter.connect(&node).await?;
        let mut guard = self.handles.write().await;
        guard.insert(provider.id.clone(), Handle { adapter, node, reachable: AtomicBool::new(true) });
        info!(provider_id = %provider.id, provider_type = ?provider.provider_type, "provider loaded");
        Ok(())
    }

    /// Current reachability as last observed by [`Self::probe_health`], or
    /// `None` if the provider has no loaded handle at all.
    pub async fn is_reachable(&self, provider_id: &str) -> Option<bool> {
        self.handles.read().await.get(provider_id).map(|h| h.reachable.load(Ordering::Relaxed))
    }

    /// Runs `health_check` against every currently loaded provider and
    /// updates its reachability flag, logging on any transition. Never
    /// touches instance status — a provider going unreachable doesn't fail
    /// or stall in-flight tasks against it by itself.
    pub async fn probe_health(&self) {
        let snapshot: Vec<(String, Arc<dyn ProviderAdapter>)> = {
            let guard = self.handles.read().await;
            guard.iter().map(|(id, h)| (id.clone(), h.adapter.clone())).collect()
        };
        for (provider_id, adapter) in snapshot {
            let healthy = adapter.health_check(&provider_id).await.is_ok();
            let guard = self.handles.read().await;
            if let Some(handle) = guard.get(&provider_id) {
                let was_healthy = handle.reachable.swap(healthy, Ordering::Relaxed);
                if was_healthy != healthy {
                    if healthy {
                        info!(provider_id, "provider became reachable");
                    } else {
                        warn!(provider_id, "provider became unreachable");
                    }
                }
            }
        }
    }

    /// Looks up a live handle's adapter without touching storage, or
    /// `NotConnected` if the provider was never loaded (spec:
    /// `GetProviderByID(id)` returns `(nil, false)` on miss).
    pub async fn get(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, CoreError> {
        self.handles
            .read()
            .await
            .get(provider_id)
            .map(|h| h.adapter.clone())
            .ok_or_else(|| CoreError::NotConnected { provider_id: provider_id.to_string() })
    }

    /// Disconnects the existing handle (if any), closes its HTTP transport
    /// and reconnects from the provider's current row (spec §4.7:
    /// `ReloadProvider`).
    pub async fn reload_provider(&self, provider_id: &str) -> Result<(), CoreError> {
        if let Some(handle) = self.handles.write().await.remove(provider_id) {
            let _ = handle.adapter.disconnect(provider_id).await;
        }
        self.transports.unregister(provider_id);
        let provider = self.storage.get_provider(provider_id).await?;
        self.load_provider(&provider).await
    }

    pub async fn unload_provider(&self, provider_id: &str) -> Result<(), CoreError> {
        if let Some(handle) = self.handles.write().await.remove(provider_id) {
            handle.adapter.disconnect(provider_id).await?;
        }
        self.transports.unregister(provider_id);
        Ok(())
    }
}

#[async_trait]
impl<S: Storage> ProviderDirectory for ProviderRegistry<S> {
    async fn adapter(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, CoreError> {
        self.get(provider_id).await
    }

    async fn node_config(&self, provider_id: &str) -> Result<NodeConfig, CoreError> {
        self.handles
            .read()
            .await
            .get(provider_id)
            .map(|h| h.node.clone())
            .ok_or_else(|| CoreError::NotConnected { provider_id: provider_id.to_string() })
    }
}

/// Maps a persisted `Provider` row onto the connection parameters an
/// adapter needs. The model has no per-provider SSH username/port fields
/// (only `credentials`, `endpoint`, `port`), so the hypervisor host's SSH
/// login is a fixed convention: port 22, user `root`, with the provider's
/// configured password/key passed straight through.
fn node_config_for(provider: &Provider) -> NodeConfig {
    NodeConfig {
        provider_id: provider.id.clone(),
        provider_type: provider.provider_type,
        execution_rule: provider.execution_rule,
        host: provider.endpoint.clone(),
        api_port: provider.port,
        ssh: fv_ssh::ConnectParams {
            provider_id: provider.id.clone(),
            host: provider.endpoint.clone(),
            port: 22,
            username: "root".to_string(),
            password: provider.credentials.password.clone(),
            private_key_pem: provider.credentials.private_key.clone(),
            connect_timeout: std::time::Duration::from_secs(10),
            execute_timeout: std::time::Duration::from_secs(30),
        },
        api_token_id: None,
        api_token_secret: provider.credentials.api_token.clone(),
        api_username: None,
        api_password: provider.credentials.password.clone(),
        accept_invalid_certs: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_core::model::{ExecutionRule, NetworkType, PortMappingMethod, ProviderCredentials, ResourceAmounts};
    use fv_storage::memory::MemoryStorage;

    fn test_provider() -> Provider {
        Provider {
            id: "p-1".into(),
            name: "test".into(),
            provider_type: ProviderType::Docker,
            endpoint: "10.0.0.5".into(),
            port: 2375,
            credentials: ProviderCredentials { password: None, private_key: None, api_token: None, tls_cert: None },
            network_type: NetworkType::NatIpv4,
            ipv4_port_mapping_method: PortMappingMethod::Native,
            ipv6_port_mapping_method: PortMappingMethod::Native,
            total_quota: ResourceAmounts::default(),
            max_container_instances: 10,
            max_vm_instances: 10,
            container_count: 0,
            vm_count: 0,
            count_cache_expires_at: None,
            default_bandwidth_mbps: 100,
            max_bandwidth_mbps: 1000,
            port_range_start: 10000,
            port_range_end: 20000,
            storage_pool: "local".into(),
            execution_rule: ExecutionRule::SshOnly,
            allow_claim: true,
            is_frozen: false,
            traffic_limited: false,
            enable_traffic_control: true,
            used_traffic_bytes: 0,
            traffic_limit_bytes: None,
            expiry: None,
        }
    }

    #[test]
    fn node_config_for_uses_endpoint_as_host_and_a_fixed_ssh_convention() {
        let provider = test_provider();
        let node = node_config_for(&provider);
        assert_eq!(node.host, "10.0.0.5");
        assert_eq!(node.ssh.host, "10.0.0.5");
        assert_eq!(node.ssh.port, 22);
        assert_eq!(node.ssh.username, "root");
        assert_eq!(node.api_port, 2375);
    }

    #[tokio::test]
    async fn get_without_load_is_not_connected() {
        let storage = Arc::new(MemoryStorage::new());
        let ssh = Arc::new(SshPool::new(Default::default()));
        let transports = Arc::new(TransportRegistry::new());
        let registry = ProviderRegistry::new(storage, ssh, transports);
        let err = registry.get("p-1").await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }
}
