//! `sqlx::MySqlPool`-backed [`Storage`] implementation.
//!
//! Every row-locking requirement in spec §4.3/§5 ("lock acquisition order is
//! (user, provider, instance)", "no cross-transaction read-before-write") maps
//! onto an explicit `SELECT ... FOR UPDATE` inside a `sqlx::Transaction`.
//! Traffic writes use `INSERT ... ON DUPLICATE KEY UPDATE` on the
//! `(instance_id, timestamp)` unique key per spec §3/§5.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fv_core::error::CoreError;
use fv_core::model::{
    Instance, InstanceStatus, InstanceType, PmacctMonitor, PortMapping, PortProtocol, PortStatus, Provider,
    ProviderCredentials, ProviderType, Reservation, ResourceAmounts, Task, TaskStatus, TaskType, TrafficHistoryBucket,
    TrafficRecord, UserQuota,
};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use tracing::{info, warn};

use crate::{Storage, TrafficResolution, TrafficScope};

pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|_| CoreError::redacted("mysql", "failed to establish connection pool"))?;
        info!(max_connections, "mysql storage pool established");
        Ok(Self { pool })
    }

    fn sql_err(context: &'static str) -> impl Fn(sqlx::Error) -> CoreError {
        move |e| {
            warn!(context, error = %e, "mysql operation failed");
            CoreError::redacted("mysql", context)
        }
    }
}

fn protocol_str(p: PortProtocol) -> &'static str {
    match p {
        PortProtocol::Tcp => "tcp",
        PortProtocol::Udp => "udp",
        PortProtocol::Both => "both",
    }
}

fn protocol_from_str(s: &str) -> PortProtocol {
    match s {
        "udp" => PortProtocol::Udp,
        "both" => PortProtocol::Both,
        _ => PortProtocol::Tcp,
    }
}

fn port_status_str(s: PortStatus) -> &'static str {
    match s {
        PortStatus::Active => "active",
        PortStatus::Pending => "pending",
        PortStatus::Failed => "failed",
    }
}

fn instance_status_str(s: InstanceStatus) -> &'static str {
    match s {
        InstanceStatus::Creating => "creating",
        InstanceStatus::Running => "running",
        InstanceStatus::Stopped => "stopped",
        InstanceStatus::Starting => "starting",
        InstanceStatus::Stopping => "stopping",
        InstanceStatus::Restarting => "restarting",
        InstanceStatus::Resetting => "resetting",
        InstanceStatus::Deleting => "deleting",
        InstanceStatus::Deleted => "deleted",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Unavailable => "unavailable",
    }
}

fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Processing => "processing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn task_status_from_str(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "processing" => TaskStatus::Processing,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    }
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Create => "create",
        TaskType::Start => "start",
        TaskType::Stop => "stop",
        TaskType::Restart => "restart",
        TaskType::Reset => "reset",
        TaskType::Delete => "delete",
        TaskType::ResetPassword => "reset-password",
    }
}

fn task_type_from_str(s: &str) -> TaskType {
    match s {
        "start" => TaskType::Start,
        "stop" => TaskType::Stop,
        "restart" => TaskType::Restart,
        "reset" => TaskType::Reset,
        "delete" => TaskType::Delete,
        "reset-password" => TaskType::ResetPassword,
        _ => TaskType::Create,
    }
}

fn network_type_from_str(s: &str) -> fv_core::model::NetworkType {
    use fv_core::model::NetworkType;
    match s {
        "nat_ipv4_ipv6" => NetworkType::NatIpv4Ipv6,
        "dedicated_ipv4" => NetworkType::DedicatedIpv4,
        "dedicated_ipv4_ipv6" => NetworkType::DedicatedIpv4Ipv6,
        "ipv6_only" => NetworkType::Ipv6Only,
        _ => NetworkType::NatIpv4,
    }
}

fn port_mapping_method_from_str(s: &str) -> fv_core::model::PortMappingMethod {
    use fv_core::model::PortMappingMethod;
    match s {
        "device_proxy" => PortMappingMethod::DeviceProxy,
        "iptables" => PortMappingMethod::Iptables,
        "native" => PortMappingMethod::Native,
        _ => PortMappingMethod::None,
    }
}

fn execution_rule_from_str(s: &str) -> fv_core::model::ExecutionRule {
    use fv_core::model::ExecutionRule;
    match s {
        "api_only" => ExecutionRule::ApiOnly,
        "ssh_only" => ExecutionRule::SshOnly,
        _ => ExecutionRule::Auto,
    }
}

#[async_trait]
impl Storage for MySqlStorage {
    async fn get_provider(&self, provider_id: &str) -> Result<Provider, CoreError> {
        let row = sqlx::query(
            "SELECT id, name, provider_type, endpoint, port, password, private_key, api_token, tls_cert, \
             network_type, ipv4_port_mapping_method, ipv6_port_mapping_method, cpu, memory_mb, disk_mb, \
             bandwidth_mbps, max_container_instances, max_vm_instances, container_count, vm_count, \
             count_cache_expires_at, default_bandwidth_mbps, max_bandwidth_mbps, port_range_start, \
             port_range_end, storage_pool, execution_rule, allow_claim, is_frozen, traffic_limited, \
             enable_traffic_control, used_traffic_bytes, traffic_limit_bytes, expiry \
             FROM providers WHERE id = ?",
        )
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::sql_err("get_provider"))?;

        let provider_type = match row.try_get::<String, _>("provider_type").unwrap_or_default().as_str() {
            "incus" => ProviderType::Incus,
            "proxmox" => ProviderType::Proxmox,
            "docker" => ProviderType::Docker,
            _ => ProviderType::Lxd,
        };

        Ok(Provider {
            id: row.try_get("id").map_err(Self::sql_err("get_provider"))?,
            name: row.try_get("name").map_err(Self::sql_err("get_provider"))?,
            provider_type,
            endpoint: row.try_get("endpoint").map_err(Self::sql_err("get_provider"))?,
            port: row.try_get::<i32, _>("port").map_err(Self::sql_err("get_provider"))? as u16,
            credentials: ProviderCredentials {
                password: row.try_get("password").ok(),
                private_key: row.try_get("private_key").ok(),
                api_token: row.try_get("api_token").ok(),
                tls_cert: row.try_get("tls_cert").ok(),
            },
            network_type: network_type_from_str(&row.try_get::<String, _>("network_type").unwrap_or_default()),
            ipv4_port_mapping_method: port_mapping_method_from_str(
                &row.try_get::<String, _>("ipv4_port_mapping_method").unwrap_or_default(),
            ),
            ipv6_port_mapping_method: port_mapping_method_from_str(
                &row.try_get::<String, _>("ipv6_port_mapping_method").unwrap_or_default(),
            ),
            total_quota: ResourceAmounts {
                cpu: row.try_get::<i32, _>("cpu").unwrap_or_default() as u32,
                memory_mb: row.try_get::<i64, _>("memory_mb").unwrap_or_default() as u64,
                disk_mb: row.try_get::<i64, _>("disk_mb").unwrap_or_default() as u64,
                bandwidth_mbps: row.try_get::<i32, _>("bandwidth_mbps").unwrap_or_default() as u32,
            },
            max_container_instances: row.try_get::<i32, _>("max_container_instances").unwrap_or_default() as u32,
            max_vm_instances: row.try_get::<i32, _>("max_vm_instances").unwrap_or_default() as u32,
            container_count: row.try_get::<i32, _>("container_count").unwrap_or_default() as u32,
            vm_count: row.try_get::<i32, _>("vm_count").unwrap_or_default() as u32,
            count_cache_expires_at: row.try_get("count_cache_expires_at").ok(),
            default_bandwidth_mbps: row.try_get::<i32, _>("default_bandwidth_mbps").unwrap_or_default() as u32,
            max_bandwidth_mbps: row.try_get::<i32, _>("max_bandwidth_mbps").unwrap_or_default() as u32,
            port_range_start: row.try_get::<i32, _>("port_range_start").unwrap_or_default() as u16,
            port_range_end: row.try_get::<i32, _>("port_range_end").unwrap_or_default() as u16,
            storage_pool: row.try_get("storage_pool").unwrap_or_else(|_| "local".to_string()),
            execution_rule: execution_rule_from_str(&row.try_get::<String, _>("execution_rule").unwrap_or_default()),
            allow_claim: row.try_get::<i8, _>("allow_claim").unwrap_or(1) != 0,
            is_frozen: row.try_get::<i8, _>("is_frozen").unwrap_or(0) != 0,
            traffic_limited: row.try_get::<i8, _>("traffic_limited").unwrap_or(0) != 0,
            enable_traffic_control: row.try_get::<i8, _>("enable_traffic_control").unwrap_or(0) != 0,
            used_traffic_bytes: row.try_get::<i64, _>("used_traffic_bytes").unwrap_or_default() as u64,
            traffic_limit_bytes: row.try_get::<Option<i64>, _>("traffic_limit_bytes").unwrap_or(None).map(|v| v as u64),
            expiry: row.try_get("expiry").ok(),
        })
    }

    async fn get_user_quota(&self, user_id: &str) -> Result<UserQuota, CoreError> {
        let row = sqlx::query(
            "SELECT user_id, level, max_instances, max_cpu, max_memory_mb, max_disk_mb, max_bandwidth_mbps, \
             used_cpu, used_memory_mb, used_disk_mb, used_bandwidth_mbps, used_instances, \
             pending_cpu, pending_memory_mb, pending_disk_mb, pending_bandwidth_mbps, pending_instances, \
             total_traffic_bytes, used_traffic_bytes FROM user_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err("get_user_quota"))?;

        let Some(row) = row else {
            return Ok(UserQuota {
                user_id: user_id.to_string(),
                ..Default::default()
            });
        };

        Ok(UserQuota {
            user_id: row.try_get("user_id").map_err(Self::sql_err("get_user_quota"))?,
            level: row.try_get::<i32, _>("level").unwrap_or_default() as u32,
            max_instances: row.try_get::<i32, _>("max_instances").unwrap_or_default() as u32,
            max_resources: ResourceAmounts {
                cpu: row.try_get::<i32, _>("max_cpu").unwrap_or_default() as u32,
                memory_mb: row.try_get::<i64, _>("max_memory_mb").unwrap_or_default() as u64,
                disk_mb: row.try_get::<i64, _>("max_disk_mb").unwrap_or_default() as u64,
                bandwidth_mbps: row.try_get::<i32, _>("max_bandwidth_mbps").unwrap_or_default() as u32,
            },
            used: ResourceAmounts {
                cpu: row.try_get::<i32, _>("used_cpu").unwrap_or_default() as u32,
                memory_mb: row.try_get::<i64, _>("used_memory_mb").unwrap_or_default() as u64,
                disk_mb: row.try_get::<i64, _>("used_disk_mb").unwrap_or_default() as u64,
                bandwidth_mbps: row.try_get::<i32, _>("used_bandwidth_mbps").unwrap_or_default() as u32,
            },
            used_instances: row.try_get::<i32, _>("used_instances").unwrap_or_default() as u32,
            pending: ResourceAmounts {
                cpu: row.try_get::<i32, _>("pending_cpu").unwrap_or_default() as u32,
                memory_mb: row.try_get::<i64, _>("pending_memory_mb").unwrap_or_default() as u64,
                disk_mb: row.try_get::<i64, _>("pending_disk_mb").unwrap_or_default() as u64,
                bandwidth_mbps: row.try_get::<i32, _>("pending_bandwidth_mbps").unwrap_or_default() as u32,
            },
            pending_instances: row.try_get::<i32, _>("pending_instances").unwrap_or_default() as u32,
            total_traffic_bytes: row.try_get::<i64, _>("total_traffic_bytes").unwrap_or_default() as u64,
            used_traffic_bytes: row.try_get::<i64, _>("used_traffic_bytes").unwrap_or_default() as u64,
        })
    }

    async fn allocate_provider_resources(
        &self,
        provider_id: &str,
        instance_type: InstanceType,
        count_cache_expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let column = match instance_type {
            InstanceType::Container => "container_count",
            InstanceType::Vm => "vm_count",
        };
        sqlx::query(&format!(
            "UPDATE providers SET {column} = {column} + 1, count_cache_expires_at = ? WHERE id = ?"
        ))
        .bind(count_cache_expires_at)
        .bind(provider_id)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("allocate_provider_resources"))?;
        Ok(())
    }

    async fn release_provider_resources(&self, provider_id: &str, instance_type: InstanceType) -> Result<(), CoreError> {
        let column = match instance_type {
            InstanceType::Container => "container_count",
            InstanceType::Vm => "vm_count",
        };
        sqlx::query(&format!("UPDATE providers SET {column} = GREATEST({column} - 1, 0) WHERE id = ?"))
            .bind(provider_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("release_provider_resources"))?;
        Ok(())
    }

    async fn reserve_resources(
        &self,
        user_id: &str,
        provider_id: &str,
        session_id: &str,
        instance_type: InstanceType,
        amounts: ResourceAmounts,
        effective_cap: &ResourceAmounts,
        effective_cap_instances: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<Reservation, CoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::sql_err("reserve_resources:begin"))?;

        let row = sqlx::query(
            "SELECT used_cpu, used_memory_mb, used_disk_mb, used_bandwidth_mbps, used_instances, \
             pending_cpu, pending_memory_mb, pending_disk_mb, pending_bandwidth_mbps, pending_instances \
             FROM user_quotas WHERE user_id = ? FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::sql_err("reserve_resources:lock"))?;

        let (used, used_instances, pending, pending_instances) = match row {
            Some(r) => (
                ResourceAmounts {
                    cpu: r.try_get::<i32, _>("used_cpu").unwrap_or_default() as u32,
                    memory_mb: r.try_get::<i64, _>("used_memory_mb").unwrap_or_default() as u64,
                    disk_mb: r.try_get::<i64, _>("used_disk_mb").unwrap_or_default() as u64,
                    bandwidth_mbps: r.try_get::<i32, _>("used_bandwidth_mbps").unwrap_or_default() as u32,
                },
                r.try_get::<i32, _>("used_instances").unwrap_or_default() as u32,
                ResourceAmounts {
                    cpu: r.try_get::<i32, _>("pending_cpu").unwrap_or_default() as u32,
                    memory_mb: r.try_get::<i64, _>("pending_memory_mb").unwrap_or_default() as u64,
                    disk_mb: r.try_get::<i64, _>("pending_disk_mb").unwrap_or_default() as u64,
                    bandwidth_mbps: r.try_get::<i32, _>("pending_bandwidth_mbps").unwrap_or_default() as u32,
                },
                r.try_get::<i32, _>("pending_instances").unwrap_or_default() as u32,
            ),
            None => (ResourceAmounts::default(), 0, ResourceAmounts::default(), 0),
        };

        let total = used.saturating_add(&pending).saturating_add(&amounts);
        if !total.fits_within(effective_cap) {
            return Err(CoreError::CapacityExhausted {
                dimension: "resources".to_string(),
            });
        }
        if used_instances + pending_instances + 1 > effective_cap_instances {
            return Err(CoreError::CapacityExhausted {
                dimension: "instances".to_string(),
            });
        }

        let new_pending = pending.saturating_add(&amounts);
        sqlx::query(
            "INSERT INTO user_quotas (user_id, pending_cpu, pending_memory_mb, pending_disk_mb, \
             pending_bandwidth_mbps, pending_instances) VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE pending_cpu = ?, pending_memory_mb = ?, pending_disk_mb = ?, \
             pending_bandwidth_mbps = ?, pending_instances = ?",
        )
        .bind(user_id)
        .bind(new_pending.cpu)
        .bind(new_pending.memory_mb as i64)
        .bind(new_pending.disk_mb as i64)
        .bind(new_pending.bandwidth_mbps)
        .bind(pending_instances as i32 + 1)
        .bind(new_pending.cpu)
        .bind(new_pending.memory_mb as i64)
        .bind(new_pending.disk_mb as i64)
        .bind(new_pending.bandwidth_mbps)
        .bind(pending_instances as i32 + 1)
        .execute(&mut *tx)
        .await
        .map_err(Self::sql_err("reserve_resources:update_quota"))?;

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            provider_id: provider_id.to_string(),
            instance_type,
            amounts,
            expires_at,
            consumed_at: None,
        };
        sqlx::query(
            "INSERT INTO reservations (id, session_id, user_id, provider_id, instance_type, cpu, memory_mb, \
             disk_mb, bandwidth_mbps, expires_at, consumed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&reservation.id)
        .bind(&reservation.session_id)
        .bind(&reservation.user_id)
        .bind(&reservation.provider_id)
        .bind(matches!(instance_type, InstanceType::Vm))
        .bind(amounts.cpu)
        .bind(amounts.memory_mb as i64)
        .bind(amounts.disk_mb as i64)
        .bind(amounts.bandwidth_mbps)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(Self::sql_err("reserve_resources:insert"))?;

        tx.commit().await.map_err(Self::sql_err("reserve_resources:commit"))?;
        Ok(reservation)
    }

    async fn consume_reservation(&self, session_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::sql_err("consume_reservation:begin"))?;
        let row = sqlx::query(
            "SELECT user_id, cpu, memory_mb, disk_mb, bandwidth_mbps, consumed_at FROM reservations \
             WHERE session_id = ? FOR UPDATE",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::sql_err("consume_reservation:lock"))?;

        let Some(row) = row else { return Ok(()) };
        let already_consumed: Option<DateTime<Utc>> = row.try_get("consumed_at").ok().flatten();
        if already_consumed.is_some() {
            return Ok(());
        }

        let amounts = ResourceAmounts {
            cpu: row.try_get::<i32, _>("cpu").unwrap_or_default() as u32,
            memory_mb: row.try_get::<i64, _>("memory_mb").unwrap_or_default() as u64,
            disk_mb: row.try_get::<i64, _>("disk_mb").unwrap_or_default() as u64,
            bandwidth_mbps: row.try_get::<i32, _>("bandwidth_mbps").unwrap_or_default() as u32,
        };
        let user_id: String = row.try_get("user_id").map_err(Self::sql_err("consume_reservation:user_id"))?;

        sqlx::query("UPDATE reservations SET consumed_at = NOW() WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(Self::sql_err("consume_reservation:mark"))?;

        sqlx::query(
            "UPDATE user_quotas SET pending_cpu = GREATEST(pending_cpu - ?, 0), \
             pending_memory_mb = GREATEST(pending_memory_mb - ?, 0), \
             pending_disk_mb = GREATEST(pending_disk_mb - ?, 0), \
             pending_bandwidth_mbps = GREATEST(pending_bandwidth_mbps - ?, 0), \
             pending_instances = GREATEST(pending_instances - 1, 0), \
             used_cpu = used_cpu + ?, used_memory_mb = used_memory_mb + ?, used_disk_mb = used_disk_mb + ?, \
             used_bandwidth_mbps = used_bandwidth_mbps + ?, used_instances = used_instances + 1 \
             WHERE user_id = ?",
        )
        .bind(amounts.cpu)
        .bind(amounts.memory_mb as i64)
        .bind(amounts.disk_mb as i64)
        .bind(amounts.bandwidth_mbps)
        .bind(amounts.cpu)
        .bind(amounts.memory_mb as i64)
        .bind(amounts.disk_mb as i64)
        .bind(amounts.bandwidth_mbps)
        .bind(&user_id)
        .execute(&mut *tx)
        .await
        .map_err(Self::sql_err("consume_reservation:apply"))?;

        tx.commit().await.map_err(Self::sql_err("consume_reservation:commit"))
    }

    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE user_quotas q JOIN reservations r ON r.user_id = q.user_id \
             SET q.pending_cpu = GREATEST(q.pending_cpu - r.cpu, 0), \
             q.pending_memory_mb = GREATEST(q.pending_memory_mb - r.memory_mb, 0), \
             q.pending_disk_mb = GREATEST(q.pending_disk_mb - r.disk_mb, 0), \
             q.pending_bandwidth_mbps = GREATEST(q.pending_bandwidth_mbps - r.bandwidth_mbps, 0), \
             q.pending_instances = GREATEST(q.pending_instances - 1, 0) \
             WHERE r.consumed_at IS NULL AND r.expires_at < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("release_expired_reservations:subtract"))?;

        let deleted = sqlx::query("DELETE FROM reservations WHERE consumed_at IS NULL AND expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("release_expired_reservations:delete"))?;

        let _ = result.rows_affected();
        Ok(deleted.rows_affected())
    }

    async fn list_active_ports(&self, provider_id: &str) -> Result<Vec<PortMapping>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, instance_id, provider_id, host_port, guest_port, protocol, is_ssh, description, status \
             FROM port_mappings WHERE provider_id = ? AND status = 'active'",
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err("list_active_ports"))?;

        rows.into_iter()
            .map(|row| {
                Ok(PortMapping {
                    id: row.try_get("id").map_err(Self::sql_err("list_active_ports"))?,
                    instance_id: row.try_get("instance_id").map_err(Self::sql_err("list_active_ports"))?,
                    provider_id: row.try_get("provider_id").map_err(Self::sql_err("list_active_ports"))?,
                    host_port: row.try_get::<i32, _>("host_port").unwrap_or_default() as u16,
                    guest_port: row.try_get::<i32, _>("guest_port").unwrap_or_default() as u16,
                    protocol: protocol_from_str(&row.try_get::<String, _>("protocol").unwrap_or_default()),
                    is_ssh: row.try_get::<i8, _>("is_ssh").unwrap_or_default() != 0,
                    description: row.try_get("description").ok(),
                    status: PortStatus::Active,
                })
            })
            .collect()
    }

    async fn insert_port(&self, mapping: PortMapping) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO port_mappings (id, instance_id, provider_id, host_port, guest_port, protocol, is_ssh, \
             description, status) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mapping.id)
        .bind(&mapping.instance_id)
        .bind(&mapping.provider_id)
        .bind(mapping.host_port)
        .bind(mapping.guest_port)
        .bind(protocol_str(mapping.protocol))
        .bind(mapping.is_ssh)
        .bind(&mapping.description)
        .bind(port_status_str(mapping.status))
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("insert_port"))?;
        Ok(())
    }

    async fn activate_port(&self, port_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE port_mappings SET status = 'active' WHERE id = ?")
            .bind(port_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("activate_port"))?;
        Ok(())
    }

    async fn release_port(&self, port_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM port_mappings WHERE id = ?")
            .bind(port_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("release_port"))?;
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, user_id, provider_id, instance_id, task_type, task_data, status, progress, \
             timeout_duration_secs, is_force_stoppable, error_message, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.provider_id)
        .bind(&task.instance_id)
        .bind(task_type_str(task.task_type))
        .bind(task.task_data.to_string())
        .bind(task_status_str(task.status))
        .bind(task.progress as i32)
        .bind(task.timeout_duration_secs as i64)
        .bind(task.is_force_stoppable)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("insert_task"))?;
        Ok(())
    }

    async fn claim_next_task(&self, provider_filter: Option<&str>) -> Result<Option<Task>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::sql_err("claim_next_task:begin"))?;
        let row = match provider_filter {
            Some(provider_id) => sqlx::query(
                "SELECT id FROM tasks WHERE status = 'pending' AND provider_id = ? \
                 ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .bind(provider_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::sql_err("claim_next_task:select"))?,
            None => sqlx::query(
                "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::sql_err("claim_next_task:select"))?,
        };
        let Some(row) = row else {
            tx.commit().await.ok();
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(Self::sql_err("claim_next_task:id"))?;
        sqlx::query("UPDATE tasks SET status = 'running' WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(Self::sql_err("claim_next_task:claim"))?;
        tx.commit().await.map_err(Self::sql_err("claim_next_task:commit"))?;
        self.get_task(&id).await.map(Some)
    }

    async fn find_in_flight_task(&self, instance_id: &str, task_type: TaskType) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query("SELECT id FROM tasks WHERE instance_id = ? AND task_type = ? AND status IN ('pending', 'running') LIMIT 1")
            .bind(instance_id)
            .bind(task_type_str(task_type))
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::sql_err("find_in_flight_task"))?;
        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(Self::sql_err("find_in_flight_task"))?;
                self.get_task(&id).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: u8,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        let completed = matches!(status, TaskStatus::Completed | TaskStatus::Failed);
        sqlx::query(
            "UPDATE tasks SET status = ?, progress = ?, error_message = ?, \
             completed_at = IF(?, NOW(), completed_at) WHERE id = ?",
        )
        .bind(task_status_str(status))
        .bind(progress as i32)
        .bind(&error_message)
        .bind(completed)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("update_task"))?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, CoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, provider_id, instance_id, task_type, task_data, status, progress, \
             timeout_duration_secs, is_force_stoppable, error_message, created_at, completed_at \
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::sql_err("get_task"))?;

        let task_data_text: String = row.try_get("task_data").unwrap_or_else(|_| "{}".to_string());
        Ok(Task {
            id: row.try_get("id").map_err(Self::sql_err("get_task"))?,
            user_id: row.try_get("user_id").map_err(Self::sql_err("get_task"))?,
            provider_id: row.try_get("provider_id").ok(),
            instance_id: row.try_get("instance_id").ok(),
            task_type: task_type_from_str(&row.try_get::<String, _>("task_type").unwrap_or_default()),
            task_data: serde_json::from_str(&task_data_text).unwrap_or(serde_json::Value::Null),
            status: task_status_from_str(&row.try_get::<String, _>("status").unwrap_or_default()),
            progress: row.try_get::<i32, _>("progress").unwrap_or_default() as u8,
            timeout_duration_secs: row.try_get::<i64, _>("timeout_duration_secs").unwrap_or_default() as u64,
            is_force_stoppable: row.try_get::<i8, _>("is_force_stoppable").unwrap_or_default() != 0,
            error_message: row.try_get("error_message").ok(),
            created_at: row.try_get("created_at").map_err(Self::sql_err("get_task"))?,
            completed_at: row.try_get("completed_at").ok(),
        })
    }

    async fn upsert_instance(&self, instance: Instance) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO instances (id, name, provider_id, user_id, instance_type, image, os_type, cpu, \
             memory_mb, disk_mb, bandwidth_mbps, private_ip, public_ip, ipv6_address, public_ipv6, ssh_port, \
             username, password, status, max_traffic_bytes, traffic_limited, traffic_limit_reason, vmid, \
             expires_at, is_manual_expiry, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE name = VALUES(name), status = VALUES(status), \
             private_ip = VALUES(private_ip), public_ip = VALUES(public_ip), \
             ipv6_address = VALUES(ipv6_address), public_ipv6 = VALUES(public_ipv6), \
             ssh_port = VALUES(ssh_port), password = VALUES(password), \
             traffic_limited = VALUES(traffic_limited), traffic_limit_reason = VALUES(traffic_limit_reason)",
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.provider_id)
        .bind(&instance.user_id)
        .bind(matches!(instance.instance_type, InstanceType::Vm))
        .bind(&instance.image)
        .bind(&instance.os_type)
        .bind(instance.resources.cpu)
        .bind(instance.resources.memory_mb as i64)
        .bind(instance.resources.disk_mb as i64)
        .bind(instance.resources.bandwidth_mbps)
        .bind(&instance.private_ip)
        .bind(&instance.public_ip)
        .bind(&instance.ipv6_address)
        .bind(&instance.public_ipv6)
        .bind(instance.ssh_port.map(|p| p as i32))
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(instance_status_str(instance.status))
        .bind(instance.max_traffic_bytes.map(|v| v as i64))
        .bind(instance.traffic_limited)
        .bind(&instance.traffic_limit_reason)
        .bind(instance.vmid.map(|v| v as i64))
        .bind(instance.expires_at)
        .bind(instance.is_manual_expiry)
        .bind(instance.created_at)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("upsert_instance"))?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance, CoreError> {
        let row = sqlx::query(
            "SELECT id, name, provider_id, user_id, instance_type, image, os_type, cpu, memory_mb, disk_mb, \
             bandwidth_mbps, private_ip, public_ip, ipv6_address, public_ipv6, ssh_port, username, password, \
             status, max_traffic_bytes, traffic_limited, traffic_limit_reason, pmacct_interface_v4, \
             pmacct_interface_v6, vmid, expires_at, is_manual_expiry, created_at FROM instances WHERE id = ?",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::sql_err("get_instance"))?;

        let instance_type = if row.try_get::<i8, _>("instance_type").unwrap_or_default() != 0 {
            InstanceType::Vm
        } else {
            InstanceType::Container
        };
        let status = match row.try_get::<String, _>("status").unwrap_or_default().as_str() {
            "running" => InstanceStatus::Running,
            "stopped" => InstanceStatus::Stopped,
            "starting" => InstanceStatus::Starting,
            "stopping" => InstanceStatus::Stopping,
            "restarting" => InstanceStatus::Restarting,
            "resetting" => InstanceStatus::Resetting,
            "deleting" => InstanceStatus::Deleting,
            "deleted" => InstanceStatus::Deleted,
            "failed" => InstanceStatus::Failed,
            "unavailable" => InstanceStatus::Unavailable,
            _ => InstanceStatus::Creating,
        };

        Ok(Instance {
            id: row.try_get("id").map_err(Self::sql_err("get_instance"))?,
            name: row.try_get("name").map_err(Self::sql_err("get_instance"))?,
            provider_id: row.try_get("provider_id").map_err(Self::sql_err("get_instance"))?,
            user_id: row.try_get("user_id").map_err(Self::sql_err("get_instance"))?,
            instance_type,
            image: row.try_get("image").map_err(Self::sql_err("get_instance"))?,
            os_type: row.try_get("os_type").unwrap_or_default(),
            resources: ResourceAmounts {
                cpu: row.try_get::<i32, _>("cpu").unwrap_or_default() as u32,
                memory_mb: row.try_get::<i64, _>("memory_mb").unwrap_or_default() as u64,
                disk_mb: row.try_get::<i64, _>("disk_mb").unwrap_or_default() as u64,
                bandwidth_mbps: row.try_get::<i32, _>("bandwidth_mbps").unwrap_or_default() as u32,
            },
            private_ip: row.try_get("private_ip").ok(),
            public_ip: row.try_get("public_ip").ok(),
            ipv6_address: row.try_get("ipv6_address").ok(),
            public_ipv6: row.try_get("public_ipv6").ok(),
            ssh_port: row.try_get::<Option<i32>, _>("ssh_port").unwrap_or(None).map(|p| p as u16),
            username: row.try_get("username").ok(),
            password: row.try_get("password").ok(),
            status,
            max_traffic_bytes: row.try_get::<Option<i64>, _>("max_traffic_bytes").unwrap_or(None).map(|v| v as u64),
            traffic_limited: row.try_get::<i8, _>("traffic_limited").unwrap_or_default() != 0,
            traffic_limit_reason: row.try_get("traffic_limit_reason").ok(),
            pmacct_interface_v4: row.try_get("pmacct_interface_v4").ok(),
            pmacct_interface_v6: row.try_get("pmacct_interface_v6").ok(),
            vmid: row.try_get::<Option<i64>, _>("vmid").unwrap_or(None).map(|v| v as u32),
            expires_at: row.try_get("expires_at").ok(),
            is_manual_expiry: row.try_get::<i8, _>("is_manual_expiry").unwrap_or_default() != 0,
            created_at: row.try_get("created_at").map_err(Self::sql_err("get_instance"))?,
        })
    }

    async fn update_instance_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), CoreError> {
        sqlx::query("UPDATE instances SET status = ? WHERE id = ?")
            .bind(instance_status_str(status))
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("update_instance_status"))?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE instances SET status = 'deleted' WHERE id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err("delete_instance"))?;
        Ok(())
    }

    async fn upsert_traffic_record(&self, instance_id: &str, record: TrafficRecord) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO traffic_records (instance_id, timestamp, rx_bytes, tx_bytes, total_bytes) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE rx_bytes = VALUES(rx_bytes), tx_bytes = VALUES(tx_bytes), \
             total_bytes = VALUES(total_bytes)",
        )
        .bind(instance_id)
        .bind(record.timestamp)
        .bind(record.rx_bytes as i64)
        .bind(record.tx_bytes as i64)
        .bind(record.total_bytes() as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("upsert_traffic_record"))?;
        Ok(())
    }

    async fn upsert_traffic_bucket(
        &self,
        scope: TrafficScope,
        resolution: TrafficResolution,
        period_key: String,
        bucket: TrafficHistoryBucket,
    ) -> Result<(), CoreError> {
        let (scope_kind, scope_id) = match scope {
            TrafficScope::Instance(id) => ("instance", id),
            TrafficScope::Provider(id) => ("provider", id),
            TrafficScope::User(id) => ("user", id),
        };
        let resolution_str = match resolution {
            TrafficResolution::Hourly => "hourly",
            TrafficResolution::Daily => "daily",
            TrafficResolution::Monthly => "monthly",
        };
        sqlx::query(
            "INSERT INTO traffic_history (scope_kind, scope_id, resolution, period_key, rx_bytes, tx_bytes) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE rx_bytes = VALUES(rx_bytes), tx_bytes = VALUES(tx_bytes)",
        )
        .bind(scope_kind)
        .bind(scope_id)
        .bind(resolution_str)
        .bind(period_key)
        .bind(bucket.rx_bytes as i64)
        .bind(bucket.tx_bytes as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("upsert_traffic_bucket"))?;
        Ok(())
    }

    async fn latest_traffic_record(&self, instance_id: &str) -> Result<Option<TrafficRecord>, CoreError> {
        let row = sqlx::query(
            "SELECT timestamp, rx_bytes, tx_bytes FROM traffic_records WHERE instance_id = ? \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err("latest_traffic_record"))?;

        row.map(|row| {
            Ok(TrafficRecord {
                timestamp: row.try_get("timestamp").map_err(Self::sql_err("latest_traffic_record"))?,
                rx_bytes: row.try_get::<i64, _>("rx_bytes").unwrap_or_default() as u64,
                tx_bytes: row.try_get::<i64, _>("tx_bytes").unwrap_or_default() as u64,
            })
        })
        .transpose()
    }

    async fn list_traffic_records(
        &self,
        instance_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficRecord>, CoreError> {
        let rows = sqlx::query(
            "SELECT timestamp, rx_bytes, tx_bytes FROM traffic_records \
             WHERE instance_id = ? AND timestamp BETWEEN ? AND ? ORDER BY timestamp ASC",
        )
        .bind(instance_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err("list_traffic_records"))?;

        rows.into_iter()
            .map(|row| {
                Ok(TrafficRecord {
                    timestamp: row.try_get("timestamp").map_err(Self::sql_err("list_traffic_records"))?,
                    rx_bytes: row.try_get::<i64, _>("rx_bytes").unwrap_or_default() as u64,
                    tx_bytes: row.try_get::<i64, _>("tx_bytes").unwrap_or_default() as u64,
                })
            })
            .collect()
    }

    async fn get_pmacct_monitor(&self, instance_id: &str) -> Result<Option<PmacctMonitor>, CoreError> {
        let row = sqlx::query(
            "SELECT instance_id, provider_id, mapped_ip, mapped_ipv6, is_enabled, last_sync \
             FROM pmacct_monitors WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err("get_pmacct_monitor"))?;

        row.map(|row| {
            Ok(PmacctMonitor {
                instance_id: row.try_get("instance_id").map_err(Self::sql_err("get_pmacct_monitor"))?,
                provider_id: row.try_get("provider_id").map_err(Self::sql_err("get_pmacct_monitor"))?,
                mapped_ip: row.try_get("mapped_ip").ok(),
                mapped_ipv6: row.try_get("mapped_ipv6").ok(),
                is_enabled: row.try_get::<i8, _>("is_enabled").unwrap_or_default() != 0,
                last_sync: row.try_get("last_sync").ok(),
            })
        })
        .transpose()
    }

    async fn list_enabled_pmacct_monitors(&self) -> Result<Vec<PmacctMonitor>, CoreError> {
        let rows = sqlx::query(
            "SELECT instance_id, provider_id, mapped_ip, mapped_ipv6, is_enabled, last_sync \
             FROM pmacct_monitors WHERE is_enabled = 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err("list_enabled_pmacct_monitors"))?;

        rows.into_iter()
            .map(|row| {
                Ok(PmacctMonitor {
                    instance_id: row.try_get("instance_id").map_err(Self::sql_err("list_enabled_pmacct_monitors"))?,
                    provider_id: row.try_get("provider_id").map_err(Self::sql_err("list_enabled_pmacct_monitors"))?,
                    mapped_ip: row.try_get("mapped_ip").ok(),
                    mapped_ipv6: row.try_get("mapped_ipv6").ok(),
                    is_enabled: row.try_get::<i8, _>("is_enabled").unwrap_or_default() != 0,
                    last_sync: row.try_get("last_sync").ok(),
                })
            })
            .collect()
    }

    async fn upsert_pmacct_monitor(&self, monitor: PmacctMonitor) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO pmacct_monitors (instance_id, provider_id, mapped_ip, mapped_ipv6, is_enabled, last_sync) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE provider_id = VALUES(provider_id), mapped_ip = VALUES(mapped_ip), \
             mapped_ipv6 = VALUES(mapped_ipv6), is_enabled = VALUES(is_enabled), last_sync = VALUES(last_sync)",
        )
        .bind(&monitor.instance_id)
        .bind(&monitor.provider_id)
        .bind(&monitor.mapped_ip)
        .bind(&monitor.mapped_ipv6)
        .bind(monitor.is_enabled)
        .bind(monitor.last_sync)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err("upsert_pmacct_monitor"))?;
        Ok(())
    }
}
