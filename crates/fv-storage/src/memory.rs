//! In-process [`Storage`] implementation backed by `Mutex<HashMap<..>>`
//! tables. Used by unit tests across the workspace and by the `fleetvisord`
//! integration test binary so neither needs a live MySQL instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fv_core::error::CoreError;
use fv_core::model::{
    Instance, InstanceStatus, InstanceType, PmacctMonitor, PortMapping, PortStatus, Provider, Reservation,
    ResourceAmounts, Task, TaskStatus, TaskType, TrafficHistoryBucket, TrafficRecord, UserQuota,
};

use crate::{Storage, TrafficResolution, TrafficScope};

#[derive(Default)]
struct Tables {
    providers: HashMap<String, Provider>,
    quotas: HashMap<String, UserQuota>,
    reservations: HashMap<String, Reservation>,
    ports: HashMap<String, PortMapping>,
    tasks: HashMap<String, Task>,
    instances: HashMap<String, Instance>,
    traffic_records: HashMap<(String, DateTime<Utc>), TrafficRecord>,
    traffic_buckets: HashMap<(String, String), TrafficHistoryBucket>,
    pmacct_monitors: HashMap<String, PmacctMonitor>,
}

pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn seed_provider(&self, provider: Provider) {
        self.tables.lock().expect("memory storage poisoned").providers.insert(provider.id.clone(), provider);
    }

    pub fn seed_user_quota(&self, quota: UserQuota) {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .quotas
            .insert(quota.user_id.clone(), quota);
    }

    fn scope_key(scope: &TrafficScope) -> String {
        match scope {
            TrafficScope::Instance(id) => format!("instance:{id}"),
            TrafficScope::Provider(id) => format!("provider:{id}"),
            TrafficScope::User(id) => format!("user:{id}"),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_provider(&self, provider_id: &str) -> Result<Provider, CoreError> {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::ValidationFailed {
                reason: format!("unknown provider {provider_id}"),
            })
    }

    async fn get_user_quota(&self, user_id: &str) -> Result<UserQuota, CoreError> {
        let guard = self.tables.lock().expect("memory storage poisoned");
        Ok(guard.quotas.get(user_id).cloned().unwrap_or_else(|| UserQuota {
            user_id: user_id.to_string(),
            ..Default::default()
        }))
    }

    async fn allocate_provider_resources(
        &self,
        provider_id: &str,
        instance_type: InstanceType,
        count_cache_expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let provider = guard.providers.get_mut(provider_id).ok_or_else(|| CoreError::ValidationFailed {
            reason: format!("unknown provider {provider_id}"),
        })?;
        match instance_type {
            InstanceType::Container => provider.container_count += 1,
            InstanceType::Vm => provider.vm_count += 1,
        }
        provider.count_cache_expires_at = Some(count_cache_expires_at);
        Ok(())
    }

    async fn release_provider_resources(&self, provider_id: &str, instance_type: InstanceType) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let Some(provider) = guard.providers.get_mut(provider_id) else {
            return Ok(());
        };
        match instance_type {
            InstanceType::Container => provider.container_count = provider.container_count.saturating_sub(1),
            InstanceType::Vm => provider.vm_count = provider.vm_count.saturating_sub(1),
        }
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
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let quota = guard.quotas.entry(user_id.to_string()).or_insert_with(|| UserQuota {
            user_id: user_id.to_string(),
            ..Default::default()
        });
        if !quota.has_room_for(&amounts, effective_cap) {
            return Err(CoreError::CapacityExhausted {
                dimension: "resources".to_string(),
            });
        }
        if !quota.has_instance_room_for(effective_cap_instances) {
            return Err(CoreError::CapacityExhausted {
                dimension: "instances".to_string(),
            });
        }
        quota.pending = quota.pending.saturating_add(&amounts);
        quota.pending_instances += 1;

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
        guard.reservations.insert(reservation.session_id.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn consume_reservation(&self, session_id: &str) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let Some(reservation) = guard.reservations.get_mut(session_id) else {
            return Ok(());
        };
        if reservation.consumed_at.is_some() {
            return Ok(());
        }
        reservation.consumed_at = Some(Utc::now());
        let (user_id, amounts) = (reservation.user_id.clone(), reservation.amounts);
        if let Some(quota) = guard.quotas.get_mut(&user_id) {
            quota.pending = quota.pending.saturating_sub(&amounts);
            quota.pending_instances = quota.pending_instances.saturating_sub(1);
            quota.used = quota.used.saturating_add(&amounts);
            quota.used_instances += 1;
        }
        Ok(())
    }

    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let expired: Vec<String> = guard
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.session_id.clone())
            .collect();
        let count = expired.len() as u64;
        for session_id in expired {
            if let Some(reservation) = guard.reservations.remove(&session_id) {
                if let Some(quota) = guard.quotas.get_mut(&reservation.user_id) {
                    quota.pending = quota.pending.saturating_sub(&reservation.amounts);
                    quota.pending_instances = quota.pending_instances.saturating_sub(1);
                }
            }
        }
        Ok(count)
    }

    async fn list_active_ports(&self, provider_id: &str) -> Result<Vec<PortMapping>, CoreError> {
        let guard = self.tables.lock().expect("memory storage poisoned");
        Ok(guard
            .ports
            .values()
            .filter(|p| p.provider_id == provider_id && p.status == PortStatus::Active)
            .cloned()
            .collect())
    }

    async fn insert_port(&self, mapping: PortMapping) -> Result<(), CoreError> {
        self.tables.lock().expect("memory storage poisoned").ports.insert(mapping.id.clone(), mapping);
        Ok(())
    }

    async fn activate_port(&self, port_id: &str) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        if let Some(port) = guard.ports.get_mut(port_id) {
            port.status = PortStatus::Active;
        }
        Ok(())
    }

    async fn release_port(&self, port_id: &str) -> Result<(), CoreError> {
        self.tables.lock().expect("memory storage poisoned").ports.remove(port_id);
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<(), CoreError> {
        self.tables.lock().expect("memory storage poisoned").tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn claim_next_task(&self, provider_filter: Option<&str>) -> Result<Option<Task>, CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let mut candidates: Vec<&Task> = guard
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| provider_filter.is_none_or(|p| t.provider_id.as_deref() == Some(p)))
            .collect();
        candidates.sort_by_key(|t| t.created_at);
        let Some(id) = candidates.first().map(|t| t.id.clone()) else {
            return Ok(None);
        };
        let task = guard.tasks.get_mut(&id).expect("task vanished under lock");
        task.status = TaskStatus::Running;
        Ok(Some(task.clone()))
    }

    async fn find_in_flight_task(&self, instance_id: &str, task_type: TaskType) -> Result<Option<Task>, CoreError> {
        let guard = self.tables.lock().expect("memory storage poisoned");
        Ok(guard
            .tasks
            .values()
            .find(|t| {
                t.instance_id.as_deref() == Some(instance_id)
                    && t.task_type == task_type
                    && matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
            })
            .cloned())
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: u8,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let task = guard.tasks.get_mut(task_id).ok_or_else(|| CoreError::ValidationFailed {
            reason: format!("unknown task {task_id}"),
        })?;
        task.status = status;
        task.progress = progress;
        task.error_message = error_message;
        if matches!(status, TaskStatus::Completed | TaskStatus::Failed) {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, CoreError> {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::ValidationFailed {
                reason: format!("unknown task {task_id}"),
            })
    }

    async fn upsert_instance(&self, instance: Instance) -> Result<(), CoreError> {
        self.tables.lock().expect("memory storage poisoned").instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance, CoreError> {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CoreError::ValidationFailed {
                reason: format!("unknown instance {instance_id}"),
            })
    }

    async fn update_instance_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().expect("memory storage poisoned");
        let instance = guard.instances.get_mut(instance_id).ok_or_else(|| CoreError::ValidationFailed {
            reason: format!("unknown instance {instance_id}"),
        })?;
        instance.status = status;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        self.tables.lock().expect("memory storage poisoned").instances.remove(instance_id);
        Ok(())
    }

    async fn upsert_traffic_record(&self, instance_id: &str, record: TrafficRecord) -> Result<(), CoreError> {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .traffic_records
            .insert((instance_id.to_string(), record.timestamp), record);
        Ok(())
    }

    async fn upsert_traffic_bucket(
        &self,
        scope: TrafficScope,
        resolution: TrafficResolution,
        period_key: String,
        bucket: TrafficHistoryBucket,
    ) -> Result<(), CoreError> {
        let key = format!("{:?}:{}", resolution, period_key);
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .traffic_buckets
            .insert((Self::scope_key(&scope), key), bucket);
        Ok(())
    }

    async fn latest_traffic_record(&self, instance_id: &str) -> Result<Option<TrafficRecord>, CoreError> {
        let guard = self.tables.lock().expect("memory storage poisoned");
        Ok(guard
            .traffic_records
            .iter()
            .filter(|((id, _), _)| id == instance_id)
            .map(|(_, record)| *record)
            .max_by_key(|record| record.timestamp))
    }

    async fn list_traffic_records(
        &self,
        instance_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficRecord>, CoreError> {
        let guard = self.tables.lock().expect("memory storage poisoned");
        let mut records: Vec<TrafficRecord> = guard
            .traffic_records
            .iter()
            .filter(|((id, ts), _)| id == instance_id && *ts >= from && *ts <= to)
            .map(|(_, record)| *record)
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn get_pmacct_monitor(&self, instance_id: &str) -> Result<Option<PmacctMonitor>, CoreError> {
        Ok(self.tables.lock().expect("memory storage poisoned").pmacct_monitors.get(instance_id).cloned())
    }

    async fn list_enabled_pmacct_monitors(&self) -> Result<Vec<PmacctMonitor>, CoreError> {
        Ok(self
            .tables
            .lock()
            .expect("memory storage poisoned")
            .pmacct_monitors
            .values()
            .filter(|m| m.is_enabled)
            .cloned()
            .collect())
    }

    async fn upsert_pmacct_monitor(&self, monitor: PmacctMonitor) -> Result<(), CoreError> {
        self.tables
            .lock()
            .expect("memory storage poisoned")
            .pmacct_monitors
            .insert(monitor.instance_id.clone(), monitor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota_cap() -> ResourceAmounts {
        ResourceAmounts {
            cpu: 8,
            memory_mb: 16_384,
            disk_mb: 100_000,
            bandwidth_mbps: 1000,
        }
    }

    #[tokio::test]
    async fn reserve_then_consume_moves_pending_to_used() {
        let storage = MemoryStorage::new();
        let amounts = ResourceAmounts {
            cpu: 2,
            memory_mb: 1024,
            disk_mb: 5000,
            bandwidth_mbps: 100,
        };
        storage
            .reserve_resources("u1", "p1", "sess1", InstanceType::Container, amounts, &quota_cap(), 10, Utc::now())
            .await
            .unwrap();
        let quota = storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.pending.cpu, 2);
        assert_eq!(quota.pending_instances, 1);

        storage.consume_reservation("sess1").await.unwrap();
        let quota = storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.pending.cpu, 0);
        assert_eq!(quota.used.cpu, 2);
        assert_eq!(quota.used_instances, 1);

        // idempotent re-consume
        storage.consume_reservation("sess1").await.unwrap();
        let quota = storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.used_instances, 1);
    }

    #[tokio::test]
    async fn reserve_over_cap_is_capacity_exhausted() {
        let storage = MemoryStorage::new();
        let huge = ResourceAmounts {
            cpu: 100,
            memory_mb: 1,
            disk_mb: 1,
            bandwidth_mbps: 1,
        };
        let err = storage
            .reserve_resources("u1", "p1", "sess1", InstanceType::Container, huge, &quota_cap(), 10, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn expired_unconsumed_reservation_is_released() {
        let storage = MemoryStorage::new();
        let amounts = ResourceAmounts {
            cpu: 1,
            memory_mb: 512,
            disk_mb: 1000,
            bandwidth_mbps: 10,
        };
        let past = Utc::now() - chrono::Duration::hours(2);
        storage
            .reserve_resources("u1", "p1", "sess1", InstanceType::Container, amounts, &quota_cap(), 10, past)
            .await
            .unwrap();
        let released = storage.release_expired_reservations(Utc::now()).await.unwrap();
        assert_eq!(released, 1);
        let quota = storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.pending.cpu, 0);
        assert_eq!(quota.pending_instances, 0);
    }

    #[tokio::test]
    async fn claim_next_task_respects_provider_filter_and_fifo() {
        let storage = MemoryStorage::new();
        let mk = |id: &str, provider: &str, created_at: DateTime<Utc>| Task {
            id: id.to_string(),
            user_id: "u1".to_string(),
            provider_id: Some(provider.to_string()),
            instance_id: None,
            task_type: fv_core::model::TaskType::Start,
            task_data: serde_json::json!({}),
            status: TaskStatus::Pending,
            progress: 0,
            timeout_duration_secs: 60,
            is_force_stoppable: false,
            error_message: None,
            created_at,
            completed_at: None,
        };
        let now = Utc::now();
        storage.insert_task(mk("t1", "p1", now)).await.unwrap();
        storage.insert_task(mk("t2", "p2", now + chrono::Duration::seconds(1))).await.unwrap();

        let claimed = storage.claim_next_task(Some("p2")).await.unwrap().unwrap();
        assert_eq!(claimed.id, "t2");
        assert_eq!(storage.get_task("t2").await.unwrap().status, TaskStatus::Running);
        assert_eq!(storage.get_task("t1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn find_in_flight_task_matches_instance_and_verb() {
        let storage = MemoryStorage::new();
        let task = Task {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            provider_id: Some("p1".to_string()),
            instance_id: Some("i1".to_string()),
            task_type: fv_core::model::TaskType::Start,
            task_data: serde_json::json!({}),
            status: TaskStatus::Pending,
            progress: 0,
            timeout_duration_secs: 60,
            is_force_stoppable: false,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        storage.insert_task(task).await.unwrap();

        assert!(storage.find_in_flight_task("i1", fv_core::model::TaskType::Start).await.unwrap().is_some());
        assert!(storage.find_in_flight_task("i1", fv_core::model::TaskType::Stop).await.unwrap().is_none());
        assert!(storage.find_in_flight_task("i2", fv_core::model::TaskType::Start).await.unwrap().is_none());
    }
}
