//! Persisted data model (spec §3). These are plain owned structs; the
//! `fv-storage` crate maps them to/from SQL rows so nothing outside that crate
//! depends on a particular database driver's row type.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hypervisor kind a `Provider` speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Lxd,
    Incus,
    Proxmox,
    Docker,
}

/// Which address families a provider's instances get, and how they're NATed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    NatIpv4,
    NatIpv4Ipv6,
    DedicatedIpv4,
    DedicatedIpv4Ipv6,
    Ipv6Only,
}

impl NetworkType {
    pub fn wants_ipv6(self) -> bool {
        matches!(
            self,
            NetworkType::NatIpv4Ipv6 | NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only
        )
    }

    pub fn wants_ipv4(self) -> bool {
        !matches!(self, NetworkType::Ipv6Only)
    }

    pub fn is_dedicated(self) -> bool {
        matches!(
            self,
            NetworkType::DedicatedIpv4 | NetworkType::DedicatedIpv4Ipv6
        )
    }
}

/// How a v4/v6 guest port is exposed on the provider host (spec §4.5 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMappingMethod {
    DeviceProxy,
    Iptables,
    Native,
    None,
}

impl PortMappingMethod {
    /// Resolve the effective v4 mapping method given the provider's configured
    /// method and its network type, per spec §4.5 step 7: dedicated networks
    /// always force `native`.
    pub fn effective_v4(configured: PortMappingMethod, network_type: NetworkType) -> Self {
        if network_type.is_dedicated() {
            PortMappingMethod::Native
        } else if network_type == NetworkType::Ipv6Only {
            PortMappingMethod::None
        } else {
            configured
        }
    }
}

/// Per-operation routing preference (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRule {
    #[default]
    Auto,
    ApiOnly,
    SshOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub api_token: Option<String>,
    pub tls_cert: Option<String>,
}

/// A registered hypervisor host (spec §3 `Provider`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
    pub port: u16,
    pub credentials: ProviderCredentials,
    pub network_type: NetworkType,
    pub ipv4_port_mapping_method: PortMappingMethod,
    pub ipv6_port_mapping_method: PortMappingMethod,
    pub total_quota: ResourceAmounts,
    pub max_container_instances: u32,
    pub max_vm_instances: u32,
    pub container_count: u32,
    pub vm_count: u32,
    pub count_cache_expires_at: Option<DateTime<Utc>>,
    pub default_bandwidth_mbps: u32,
    pub max_bandwidth_mbps: u32,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub storage_pool: String,
    pub execution_rule: ExecutionRule,
    pub allow_claim: bool,
    pub is_frozen: bool,
    pub traffic_limited: bool,
    pub enable_traffic_control: bool,
    pub used_traffic_bytes: u64,
    pub traffic_limit_bytes: Option<u64>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Provider {
    /// Whether the provider's instance-count cache is stale and a fresh
    /// `COUNT(*)` query must be used instead (spec §4.3).
    pub fn count_cache_expired(&self, now: DateTime<Utc>) -> bool {
        match self.count_cache_expires_at {
            Some(exp) => now >= exp,
            None => true,
        }
    }

    /// Whether the provider has hit its global traffic cap (spec §4.6).
    pub fn traffic_exhausted(&self) -> bool {
        match self.traffic_limit_bytes {
            Some(limit) => self.used_traffic_bytes >= limit,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Container,
    Vm,
}

/// Instance lifecycle status (spec §3/§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Starting,
    Stopping,
    Restarting,
    Resetting,
    Deleting,
    Deleted,
    Failed,
    Unavailable,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Restarting => "restarting",
            Self::Resetting => "resetting",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

/// Resource amounts in a single dimension-tagged bundle, reused for requests,
/// quotas, reservations and level limits (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmounts {
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub bandwidth_mbps: u32,
}

impl ResourceAmounts {
    pub fn fits_within(&self, cap: &ResourceAmounts) -> bool {
        self.cpu <= cap.cpu
            && self.memory_mb <= cap.memory_mb
            && self.disk_mb <= cap.disk_mb
            && self.bandwidth_mbps <= cap.bandwidth_mbps
    }

    pub fn saturating_add(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            bandwidth_mbps: self.bandwidth_mbps + other.bandwidth_mbps,
        }
    }

    pub fn saturating_sub(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            bandwidth_mbps: self.bandwidth_mbps.saturating_sub(other.bandwidth_mbps),
        }
    }

    /// Per-dimension `min(self, other)`, used to combine global/provider level
    /// caps (spec §3 "the effective cap is `min(global[level], provider[level])`").
    pub fn component_min(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu: self.cpu.min(other.cpu),
            memory_mb: self.memory_mb.min(other.memory_mb),
            disk_mb: self.disk_mb.min(other.disk_mb),
            bandwidth_mbps: self.bandwidth_mbps.min(other.bandwidth_mbps),
        }
    }
}

/// A compute instance (spec §3 `Instance`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    pub user_id: String,
    pub instance_type: InstanceType,
    pub image: String,
    pub os_type: String,
    pub resources: ResourceAmounts,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub ipv6_address: Option<String>,
    pub public_ipv6: Option<String>,
    pub ssh_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub status: InstanceStatus,
    pub max_traffic_bytes: Option<u64>,
    pub traffic_limited: bool,
    pub traffic_limit_reason: Option<String>,
    pub pmacct_interface_v4: Option<String>,
    pub pmacct_interface_v6: Option<String>,
    pub vmid: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_manual_expiry: bool,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Invariant (spec §3): a `running` row must have a non-empty private_ip OR
    /// public_ipv6.
    pub fn running_address_invariant_holds(&self) -> bool {
        if self.status != InstanceStatus::Running {
            return true;
        }
        self.private_ip.as_deref().is_some_and(|s| !s.is_empty())
            || self.public_ipv6.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    Tcp,
    Udp,
    Both,
}

impl PortProtocol {
    /// Whether two protocol values conflict for port-uniqueness purposes (spec
    /// §8 invariant 3): `both` conflicts with either `tcp` or `udp`.
    pub fn conflicts_with(self, other: PortProtocol) -> bool {
        self == other || self == PortProtocol::Both || other == PortProtocol::Both
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Active,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub instance_id: String,
    pub provider_id: String,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: PortProtocol,
    pub is_ssh: bool,
    pub description: Option<String>,
    pub status: PortStatus,
}

/// A conditional pre-charge against user quota (spec §3 `Resource reservation`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub provider_id: String,
    pub instance_type: InstanceType,
    pub amounts: ResourceAmounts,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && now >= self.expires_at
    }
}

/// Per-user quota row (spec §3 `User quota`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    pub level: u32,
    pub max_instances: u32,
    pub max_resources: ResourceAmounts,
    pub used: ResourceAmounts,
    pub used_instances: u32,
    pub pending: ResourceAmounts,
    pub pending_instances: u32,
    pub total_traffic_bytes: u64,
    pub used_traffic_bytes: u64,
}

impl UserQuota {
    /// Invariant (spec §8 #1): `used + pending + requested <= cap` per dimension.
    pub fn has_room_for(&self, requested: &ResourceAmounts, cap: &ResourceAmounts) -> bool {
        let total = self.used.saturating_add(&self.pending).saturating_add(requested);
        total.fits_within(cap)
    }

    pub fn has_instance_room_for(&self, cap_instances: u32) -> bool {
        self.used_instances + self.pending_instances < cap_instances
    }
}

/// Global or per-provider level overlay (spec §3 `Level limits`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelLimits {
    pub max_instances: u32,
    pub max_resources: ResourceAmounts,
    pub max_traffic_bytes: u64,
}

/// Combine global and provider-level caps for a level, per dimension `min`.
pub fn effective_level_cap(global: &LevelLimits, provider: &LevelLimits) -> LevelLimits {
    LevelLimits {
        max_instances: global.max_instances.min(provider.max_instances),
        max_resources: global.max_resources.component_min(&provider.max_resources),
        max_traffic_bytes: global.max_traffic_bytes.min(provider.max_traffic_bytes),
    }
}

/// Per-instance pmacct monitor state (spec §3 `Pmacct monitor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmacctMonitor {
    pub instance_id: String,
    pub provider_id: String,
    pub mapped_ip: Option<String>,
    pub mapped_ipv6: Option<String>,
    pub is_enabled: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

/// A 5-minute cumulative traffic snapshot (spec §3 `Pmacct traffic record`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: DateTime<Utc>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl TrafficRecord {
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes + self.tx_bytes
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficHistoryBucket {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Create,
    Start,
    Stop,
    Restart,
    Reset,
    Delete,
    #[serde(rename = "reset-password")]
    ResetPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Processing,
    Completed,
    Failed,
}

/// A unit of work processed by the task runner (spec §3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub provider_id: Option<String>,
    pub instance_id: Option<String>,
    pub task_type: TaskType,
    pub task_data: serde_json::Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub timeout_duration_secs: u64,
    pub is_force_stoppable: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Metadata the lifecycle engine passes into a provider adapter (spec §4.2
/// `InstanceConfig.metadata`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetadata(pub HashMap<String, String>);

impl InstanceMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_protocol_conflict_rules() {
        assert!(PortProtocol::Tcp.conflicts_with(PortProtocol::Tcp));
        assert!(!PortProtocol::Tcp.conflicts_with(PortProtocol::Udp));
        assert!(PortProtocol::Both.conflicts_with(PortProtocol::Tcp));
        assert!(PortProtocol::Udp.conflicts_with(PortProtocol::Both));
    }

    #[test]
    fn resource_amounts_fit_and_min() {
        let cap = ResourceAmounts {
            cpu: 4,
            memory_mb: 4096,
            disk_mb: 20_000,
            bandwidth_mbps: 500,
        };
        let req = ResourceAmounts {
            cpu: 2,
            memory_mb: 1024,
            disk_mb: 5_000,
            bandwidth_mbps: 200,
        };
        assert!(req.fits_within(&cap));
        let over = ResourceAmounts {
            cpu: 8,
            ..req
        };
        assert!(!over.fits_within(&cap));
    }

    #[test]
    fn effective_level_cap_takes_component_min() {
        let global = LevelLimits {
            max_instances: 10,
            max_resources: ResourceAmounts {
                cpu: 8,
                memory_mb: 8192,
                disk_mb: 100_000,
                bandwidth_mbps: 1000,
            },
            max_traffic_bytes: 1_000_000,
        };
        let provider = LevelLimits {
            max_instances: 5,
            max_resources: ResourceAmounts {
                cpu: 4,
                memory_mb: 16_384,
                disk_mb: 50_000,
                bandwidth_mbps: 2000,
            },
            max_traffic_bytes: 500_000,
        };
        let eff = effective_level_cap(&global, &provider);
        assert_eq!(eff.max_instances, 5);
        assert_eq!(eff.max_resources.cpu, 4);
        assert_eq!(eff.max_resources.memory_mb, 8192);
        assert_eq!(eff.max_traffic_bytes, 500_000);
    }

    #[test]
    fn running_instance_requires_an_address() {
        let base = Instance {
            id: "i1".into(),
            name: "n".into(),
            provider_id: "p".into(),
            user_id: "u".into(),
            instance_type: InstanceType::Container,
            image: "debian-12".into(),
            os_type: "linux".into(),
            resources: ResourceAmounts::default(),
            private_ip: None,
            public_ip: None,
            ipv6_address: None,
            public_ipv6: None,
            ssh_port: None,
            username: None,
            password: None,
            status: InstanceStatus::Running,
            max_traffic_bytes: None,
            traffic_limited: false,
            traffic_limit_reason: None,
            pmacct_interface_v4: None,
            pmacct_interface_v6: None,
            vmid: None,
            expires_at: None,
            is_manual_expiry: false,
            created_at: Utc::now(),
        };
        assert!(!base.running_address_invariant_holds());
        let mut with_ip = base.clone();
        with_ip.private_ip = Some("172.16.1.2".into());
        assert!(with_ip.running_address_invariant_holds());
    }

    #[test]
    fn port_mapping_method_forces_native_for_dedicated() {
        assert_eq!(
            PortMappingMethod::effective_v4(PortMappingMethod::Iptables, NetworkType::DedicatedIpv4),
            PortMappingMethod::Native
        );
        assert_eq!(
            PortMappingMethod::effective_v4(PortMappingMethod::Iptables, NetworkType::Ipv6Only),
            PortMappingMethod::None
        );
        assert_eq!(
            PortMappingMethod::effective_v4(PortMappingMethod::DeviceProxy, NetworkType::NatIpv4),
            PortMappingMethod::DeviceProxy
        );
    }
}
