//! The three-phase create flow (spec §4.4 "Create task"): a short
//! transaction to reserve quota, a long unlocked phase that talks to the
//! hypervisor, and a final short transaction that persists the result —
//! with compensation (port/VMID release) if the middle phase fails.
//!
//! The plan-execute-commit split keeps the quota/VMID/port row locks held
//! only across the two short transactions, never across the slow adapter
//! call in the middle.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use fv_core::error::CoreError;
use fv_core::model::{Instance, InstanceStatus, InstanceType, ProviderType, ResourceAmounts, Task};
use fv_provider::InstanceConfig;
use fv_reservation::ports::RequestedPort;
use fv_storage::Storage;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{Engine, PostCreateHooks, ProviderDirectory};

/// How long a provider's `container_count`/`vm_count` cache is trusted
/// before a fresh `COUNT(*)` is warranted (spec §4.3/§4.4 Phase 1
/// `AllocateResources`).
const PROVIDER_COUNT_CACHE_TTL_SECS: i64 = 5 * 60;

/// Spec §4.4 Phase 3 failure path: a `failed` instance row is deleted this
/// long after the failure is recorded.
const FAILED_INSTANCE_DELETE_DELAY: Duration = Duration::from_secs(10);

/// Deserialized from `Task::task_data` for a `create` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub user_id: String,
    pub provider_id: String,
    pub session_id: String,
    pub name: String,
    pub image: String,
    pub os_type: String,
    pub instance_type: InstanceType,
    pub resources: ResourceAmounts,
    pub guest_ssh_port: u16,
    pub extra_ports: Vec<RequestedPort>,
    pub metadata: HashMap<String, String>,
}

pub async fn run_create_task<S: Storage + 'static, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let req: CreateRequest = serde_json::from_value(task.task_data.clone())
        .map_err(|e| CoreError::ValidationFailed { reason: e.to_string() })?;
    create_instance(engine, &req).await.map(|_| ())
}

/// Runs all three phases for one instance, returning the persisted [`Instance`]
/// row on success.
#[instrument(skip(engine), fields(provider_id = %req.provider_id, user_id = %req.user_id))]
pub async fn create_instance<S: Storage + 'static, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    req: &CreateRequest,
) -> Result<Instance, CoreError> {
    // Phase 1: short transaction — reserve quota, write the `creating` row,
    // allocate the provider's instance-count counters, and consume the
    // reservation, all before the unlocked remote call in phase 2.
    engine
        .quota
        .reserve(
            &req.user_id,
            &req.provider_id,
            &req.session_id,
            req.instance_type,
            req.resources,
        )
        .await?;

    let instance_id = Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let creating = Instance {
        id: instance_id.clone(),
        name: req.name.clone(),
        provider_id: req.provider_id.clone(),
        user_id: req.user_id.clone(),
        instance_type: req.instance_type,
        image: req.image.clone(),
        os_type: req.os_type.clone(),
        resources: req.resources,
        private_ip: None,
        public_ip: None,
        ipv6_address: None,
        public_ipv6: None,
        ssh_port: None,
        username: None,
        password: None,
        status: InstanceStatus::Creating,
        max_traffic_bytes: None,
        traffic_limited: false,
        traffic_limit_reason: None,
        pmacct_interface_v4: None,
        pmacct_interface_v6: None,
        vmid: None,
        expires_at: None,
        is_manual_expiry: false,
        created_at,
    };
    engine.storage.upsert_instance(creating).await?;
    engine
        .storage
        .allocate_provider_resources(
            &req.provider_id,
            req.instance_type,
            created_at + chrono::Duration::seconds(PROVIDER_COUNT_CACHE_TTL_SECS),
        )
        .await?;
    engine.quota.consume(&req.session_id).await?;

    // Phase 2: long operation, no lock held. `allocated_ports` accumulates as
    // soon as each row is inserted `pending`, so a later failure in this
    // phase can release exactly what was allocated so far.
    let mut allocated_ports = Vec::new();
    match provision(engine, req, &instance_id, &mut allocated_ports).await {
        Ok((remote, vmid)) => {
            // Phase 3: short transaction, persist the result.
            engine.ports.activate_all(&allocated_ports).await?;

            let ssh_port = allocated_ports.iter().find(|p| p.is_ssh).map(|p| p.host_port);
            let instance = Instance {
                id: instance_id,
                name: req.name.clone(),
                provider_id: req.provider_id.clone(),
                user_id: req.user_id.clone(),
                instance_type: req.instance_type,
                image: req.image.clone(),
                os_type: req.os_type.clone(),
                resources: req.resources,
                private_ip: remote.ipv4.clone(),
                public_ip: None,
                ipv6_address: remote.ipv6.clone(),
                public_ipv6: None,
                ssh_port,
                username: None,
                password: None,
                status: InstanceStatus::Running,
                max_traffic_bytes: None,
                traffic_limited: false,
                traffic_limit_reason: None,
                pmacct_interface_v4: None,
                pmacct_interface_v6: None,
                vmid,
                expires_at: None,
                is_manual_expiry: false,
                created_at,
            };
            engine.storage.upsert_instance(instance.clone()).await?;
            engine.hooks.on_instance_running(&instance).await?;
            info!(instance_id = %instance.id, "instance created");
            Ok(instance)
        }
        Err(e) => {
            // Compensation (spec §4.4 Phase 3 failure path): release the
            // ports allocated so far, mark the row `failed`, roll back the
            // provider counters, and schedule the row's delayed delete.
            let _ = engine.ports.release_all(&allocated_ports).await;
            if let Err(mark_err) = engine.storage.update_instance_status(&instance_id, InstanceStatus::Failed).await {
                warn!(instance_id, error = %mark_err, "failed to mark instance failed after create failure");
            }
            if let Err(release_err) = engine.storage.release_provider_resources(&req.provider_id, req.instance_type).await
            {
                warn!(instance_id, error = %release_err, "failed to release provider counters after create failure");
            }

            let storage = engine.storage.clone();
            let delete_id = instance_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FAILED_INSTANCE_DELETE_DELAY).await;
                if let Err(delete_err) = storage.delete_instance(&delete_id).await {
                    warn!(instance_id = %delete_id, error = %delete_err, "delayed delete of failed instance failed");
                }
            });

            Err(e)
        }
    }
}

async fn provision<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    req: &CreateRequest,
    instance_id: &str,
    allocated_ports: &mut Vec<fv_core::model::PortMapping>,
) -> Result<(fv_provider::RemoteInstance, Option<u32>), CoreError> {
    let provider = engine.storage.get_provider(&req.provider_id).await?;
    let adapter = engine.directory.adapter(&req.provider_id).await?;
    let node_config = engine.directory.node_config(&req.provider_id).await?;

    let (vmid, internal_ip) = if provider.provider_type == ProviderType::Proxmox {
        let (id, internal_ip) = engine.vmid.allocate(&req.provider_id, &node_config.ssh).await?;
        (Some(id), Some(internal_ip))
    } else {
        (None, None)
    };

    let port_mappings = engine
        .ports
        .allocate(
            &req.provider_id,
            instance_id,
            req.guest_ssh_port,
            provider.port_range_start,
            provider.port_range_end,
            &req.extra_ports,
        )
        .await?;
    allocated_ports.extend(port_mappings.iter().cloned());

    let mut metadata = req.metadata.clone();
    metadata.insert("instance_id".to_string(), instance_id.to_string());
    metadata.insert("provider_id".to_string(), req.provider_id.clone());
    if let Some(id) = vmid {
        metadata.insert("vmid".to_string(), id.to_string());
    }
    if let Some(ip) = internal_ip {
        metadata.insert("internal_ip".to_string(), ip);
    }

    let ports = port_mappings
        .iter()
        .map(|p| format!("{}:{}/{}", p.host_port, p.guest_port, protocol_str(p.protocol)))
        .collect();

    let config = InstanceConfig {
        name: req.name.clone(),
        image: req.image.clone(),
        image_url: None,
        cpu: req.resources.cpu,
        memory: format!("{}m", req.resources.memory_mb),
        disk: format!("{}m", req.resources.disk_mb),
        instance_type: match req.instance_type {
            InstanceType::Container => "container".to_string(),
            InstanceType::Vm => "vm".to_string(),
        },
        ports,
        metadata,
    };

    let remote = adapter
        .create_instance_with_progress(&req.provider_id, &config, &mut |pct, msg| {
            info!(instance_id, pct, msg, "create progress");
        })
        .await?;

    Ok((remote, vmid))
}

fn protocol_str(p: fv_core::model::PortProtocol) -> &'static str {
    match p {
        fv_core::model::PortProtocol::Tcp => "tcp",
        fv_core::model::PortProtocol::Udp => "udp",
        fv_core::model::PortProtocol::Both => "both",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_engine;
    use fv_core::model::{Provider, ProviderCredentials};

    fn seed_provider(engine: &Engine<fv_storage::memory::MemoryStorage, impl ProviderDirectory, impl crate::PostCreateHooks>) {
        engine.storage.seed_provider(Provider {
            id: "p1".to_string(),
            name: "docker-1".to_string(),
            provider_type: ProviderType::Docker,
            endpoint: "localhost".to_string(),
            port: 2375,
            credentials: ProviderCredentials {
                password: None,
                private_key: None,
                api_token: None,
                tls_cert: None,
            },
            network_type: fv_core::model::NetworkType::NatIpv4,
            ipv4_port_mapping_method: fv_core::model::PortMappingMethod::DeviceProxy,
            ipv6_port_mapping_method: fv_core::model::PortMappingMethod::None,
            total_quota: ResourceAmounts::default(),
            max_container_instances: 100,
            max_vm_instances: 0,
            container_count: 0,
            vm_count: 0,
            count_cache_expires_at: None,
            default_bandwidth_mbps: 100,
            max_bandwidth_mbps: 1000,
            port_range_start: 10000,
            port_range_end: 10010,
            storage_pool: "default".to_string(),
            execution_rule: fv_core::model::ExecutionRule::Auto,
            allow_claim: true,
            is_frozen: false,
            traffic_limited: false,
            enable_traffic_control: false,
            used_traffic_bytes: 0,
            traffic_limit_bytes: None,
            expiry: None,
        });
    }

    fn sample_request() -> CreateRequest {
        CreateRequest {
            user_id: "u1".to_string(),
            provider_id: "p1".to_string(),
            session_id: "sess-1".to_string(),
            name: "box1".to_string(),
            image: "debian-12".to_string(),
            os_type: "linux".to_string(),
            instance_type: InstanceType::Container,
            resources: ResourceAmounts {
                cpu: 1,
                memory_mb: 512,
                disk_mb: 5_000,
                bandwidth_mbps: 10,
            },
            guest_ssh_port: 22,
            extra_ports: vec![],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_instance_persists_a_running_instance_with_an_ssh_port() {
        let engine = test_engine();
        engine.storage.seed_user_quota(fv_core::model::UserQuota {
            user_id: "u1".to_string(),
            level: 0,
            ..Default::default()
        });
        seed_provider(&engine);

        let instance = create_instance(&engine, &sample_request()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.ssh_port, Some(10000));
        assert!(instance.private_ip.is_some());

        let quota = engine.storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.used.cpu, 1);
        assert_eq!(quota.pending.cpu, 0);
    }

    #[tokio::test]
    async fn over_quota_request_fails_without_leaking_port_rows() {
        let engine = test_engine();
        engine.storage.seed_user_quota(fv_core::model::UserQuota {
            user_id: "u1".to_string(),
            level: 0,
            ..Default::default()
        });
        seed_provider(&engine);

        let mut req = sample_request();
        req.resources.cpu = 100;
        let err = create_instance(&engine, &req).await.unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted { .. }));
        assert!(engine.storage.list_active_ports("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_instance_allocates_provider_counters_before_provisioning() {
        let engine = test_engine();
        engine.storage.seed_user_quota(fv_core::model::UserQuota {
            user_id: "u1".to_string(),
            level: 0,
            ..Default::default()
        });
        seed_provider(&engine);

        create_instance(&engine, &sample_request()).await.unwrap();
        let provider = engine.storage.get_provider("p1").await.unwrap();
        assert_eq!(provider.container_count, 1);
        assert_eq!(provider.vm_count, 0);
        assert!(provider.count_cache_expires_at.is_some());
    }
}
