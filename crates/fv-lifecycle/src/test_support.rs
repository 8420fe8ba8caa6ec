//! Shared test fixtures: a `ProviderAdapter` fake that exercises the
//! lifecycle flows without a real hypervisor or SSH connection underneath,
//! used by the `actions`, `create` and `password` test modules.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::{
    Instance, InstanceStatus, InstanceType, LevelLimits, ProviderType, ResourceAmounts, Task, TaskStatus, TaskType,
};
use fv_provider::{InstanceConfig, NodeConfig, ProgressCallback, ProviderAdapter, RemoteImage, RemoteInstance};
use fv_reservation::{PortAllocator, QuotaEngine, VmidAllocator, quota::LevelLimitsTable};
use fv_ssh::SshPool;
use fv_storage::memory::MemoryStorage;

use crate::{Engine, NoopPostCreateHooks, ProviderDirectory};

pub(crate) struct FakeAdapter;

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn get_type(&self) -> ProviderType {
        ProviderType::Docker
    }
    fn get_name(&self) -> &str {
        "fake"
    }
    fn get_version(&self) -> &str {
        "0"
    }
    fn get_supported_instance_types(&self) -> Vec<String> {
        vec!["container".to_string()]
    }

    async fn connect(&self, _cfg: &NodeConfig) -> Result<(), CoreError> {
        Ok(())
    }
    async fn disconnect(&self, _provider_id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn is_connected(&self, _provider_id: &str) -> bool {
        true
    }
    async fn health_check(&self, _provider_id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn list_instances(&self, _provider_id: &str) -> Result<Vec<RemoteInstance>, CoreError> {
        Ok(vec![])
    }
    async fn get_instance(&self, _provider_id: &str, id: &str) -> Result<RemoteInstance, CoreError> {
        Ok(RemoteInstance {
            id: id.to_string(),
            name: id.to_string(),
            status: "running".to_string(),
            ipv4: Some("172.16.1.2".to_string()),
            ipv6: None,
        })
    }

    async fn create_instance(&self, _provider_id: &str, cfg: &InstanceConfig) -> Result<RemoteInstance, CoreError> {
        Ok(RemoteInstance {
            id: cfg.name.clone(),
            name: cfg.name.clone(),
            status: "running".to_string(),
            ipv4: Some("172.16.1.2".to_string()),
            ipv6: None,
        })
    }

    async fn create_instance_with_progress(
        &self,
        provider_id: &str,
        cfg: &InstanceConfig,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<RemoteInstance, CoreError> {
        progress(0, "starting");
        let result = self.create_instance(provider_id, cfg).await;
        progress(100, "done");
        result
    }

    async fn start_instance(&self, _provider_id: &str, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn stop_instance(&self, _provider_id: &str, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn restart_instance(&self, _provider_id: &str, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn delete_instance(&self, _provider_id: &str, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn list_images(&self, _provider_id: &str) -> Result<Vec<RemoteImage>, CoreError> {
        Ok(vec![])
    }
    async fn pull_image(&self, _provider_id: &str, url: &str) -> Result<RemoteImage, CoreError> {
        Ok(RemoteImage {
            id: url.to_string(),
            alias: url.to_string(),
        })
    }
    async fn delete_image(&self, _provider_id: &str, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_instance_password(&self, _provider_id: &str, _id: &str, _password: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn get_instance_ipv4(&self, _provider_id: &str, _name: &str) -> Result<Option<String>, CoreError> {
        Ok(Some("172.16.1.2".to_string()))
    }
    async fn get_instance_ipv6(&self, _provider_id: &str, _name: &str) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
    async fn get_instance_public_ipv6(&self, _provider_id: &str, _name: &str) -> Result<Option<String>, CoreError> {
        Ok(None)
    }

    async fn execute_ssh_command(
        &self,
        _provider_id: &str,
        _command: &str,
    ) -> Result<fv_ssh::CommandOutput, CoreError> {
        Err(CoreError::NotConnected {
            provider_id: "fake".to_string(),
        })
    }
}

pub(crate) struct FakeDirectory(pub Arc<FakeAdapter>);

#[async_trait]
impl ProviderDirectory for FakeDirectory {
    async fn adapter(&self, _provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, CoreError> {
        Ok(self.0.clone())
    }

    async fn node_config(&self, provider_id: &str) -> Result<NodeConfig, CoreError> {
        Ok(NodeConfig {
            provider_id: provider_id.to_string(),
            provider_type: ProviderType::Docker,
            execution_rule: Default::default(),
            host: "localhost".to_string(),
            api_port: 2375,
            ssh: fv_ssh::ConnectParams {
                provider_id: provider_id.to_string(),
                host: "localhost".to_string(),
                port: 22,
                username: "root".to_string(),
                password: None,
                private_key_pem: None,
                connect_timeout: std::time::Duration::from_secs(1),
                execute_timeout: std::time::Duration::from_secs(1),
            },
            api_token_id: None,
            api_token_secret: None,
            api_username: None,
            api_password: None,
            accept_invalid_certs: true,
        })
    }
}

/// A level-0 table with generous headroom, so tests can focus on the
/// behavior under exercise rather than on tuning quota numbers.
fn roomy_level_table() -> LevelLimitsTable {
    let mut global = HashMap::new();
    global.insert(
        0,
        LevelLimits {
            max_instances: 10,
            max_resources: ResourceAmounts {
                cpu: 16,
                memory_mb: 16_384,
                disk_mb: 200_000,
                bandwidth_mbps: 1000,
            },
            max_traffic_bytes: 1_000_000_000,
        },
    );
    LevelLimitsTable {
        global,
        per_provider: HashMap::new(),
    }
}

pub(crate) fn test_engine() -> Engine<MemoryStorage, FakeDirectory, NoopPostCreateHooks> {
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(FakeDirectory(Arc::new(FakeAdapter)));
    let quota = Arc::new(QuotaEngine::new(
        storage.clone(),
        roomy_level_table(),
        std::time::Duration::from_secs(3600),
    ));
    let vmid = Arc::new(VmidAllocator::new(Arc::new(SshPool::new(Default::default()))));
    let ports = Arc::new(PortAllocator::new(storage.clone()));
    Engine::new(storage, directory, Arc::new(NoopPostCreateHooks), quota, vmid, ports)
}

pub(crate) fn seed_instance(status: InstanceStatus) -> Instance {
    Instance {
        id: "i1".to_string(),
        name: "box1".to_string(),
        provider_id: "p1".to_string(),
        user_id: "u1".to_string(),
        instance_type: InstanceType::Container,
        image: "debian-12".to_string(),
        os_type: "linux".to_string(),
        resources: ResourceAmounts::default(),
        private_ip: Some("172.16.1.2".to_string()),
        public_ip: None,
        ipv6_address: None,
        public_ipv6: None,
        ssh_port: Some(10000),
        username: None,
        password: None,
        status,
        max_traffic_bytes: None,
        traffic_limited: false,
        traffic_limit_reason: None,
        pmacct_interface_v4: None,
        pmacct_interface_v6: None,
        vmid: None,
        expires_at: None,
        is_manual_expiry: false,
        created_at: chrono::Utc::now(),
    }
}

pub(crate) fn task_for(instance_id: &str, task_type: TaskType) -> Task {
    Task {
        id: "t1".to_string(),
        user_id: "u1".to_string(),
        provider_id: Some("p1".to_string()),
        instance_id: Some(instance_id.to_string()),
        task_type,
        task_data: serde_json::json!({}),
        status: TaskStatus::Running,
        progress: 0,
        timeout_duration_secs: 60,
        is_force_stoppable: true,
        error_message: None,
        created_at: chrono::Utc::now(),
        completed_at: None,
    }
}
