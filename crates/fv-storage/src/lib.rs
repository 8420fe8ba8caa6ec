//! Relational persistence (spec §3 "All entities are persisted in a
//! relational store with row-level locking").
//!
//! [`Storage`] is the only way the rest of the workspace talks to the
//! database — nobody else imports `sqlx`. A narrow trait over a concrete
//! backend, with an in-memory implementation alongside the real one for
//! tests.

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fv_core::error::CoreError;
use fv_core::model::{
    Instance, InstanceStatus, InstanceType, PmacctMonitor, PortMapping, Provider, Reservation, ResourceAmounts, Task,
    TaskStatus, TaskType, TrafficHistoryBucket, TrafficRecord, UserQuota,
};

/// Which entity a rolled-up traffic bucket belongs to (spec §3 "Traffic
/// history ... rollups for instance, provider and user").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficScope {
    Instance(String),
    Provider(String),
    User(String),
}

/// Resolution of a traffic history bucket (spec §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficResolution {
    Hourly,
    Daily,
    Monthly,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_provider(&self, provider_id: &str) -> Result<Provider, CoreError>;
    async fn get_user_quota(&self, user_id: &str) -> Result<UserQuota, CoreError>;

    /// `AllocateResources` (spec §4.4 Phase 1): row-locked increment of the
    /// provider's live instance-count cache — `container_count` or
    /// `vm_count` by `instance_type` — and refresh of
    /// `count_cache_expires_at`.
    async fn allocate_provider_resources(
        &self,
        provider_id: &str,
        instance_type: InstanceType,
        count_cache_expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// `ReleaseResources` (spec §4.4 Phase 3 failure path, Delete task "free
    /// counters"): the inverse of [`Storage::allocate_provider_resources`],
    /// saturating at zero.
    async fn release_provider_resources(&self, provider_id: &str, instance_type: InstanceType) -> Result<(), CoreError>;

    /// Row-locked reserve transaction (spec §4.3): lock the user quota row,
    /// verify `used + pending + requested <= min(global, provider)`, write a
    /// reservation row, add `requested` to `pending_*`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<Reservation, CoreError>;

    /// Idempotent: marks consumed, moves `requested` from `pending_*` to
    /// `used_*`. A re-consume of an already-consumed session is a no-op.
    async fn consume_reservation(&self, session_id: &str) -> Result<(), CoreError>;

    /// Releases reservations with `expires_at < now` and `consumed_at IS
    /// NULL`, subtracting from `pending_*`. Returns the count released.
    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64, CoreError>;

    async fn list_active_ports(&self, provider_id: &str) -> Result<Vec<PortMapping>, CoreError>;
    async fn insert_port(&self, mapping: PortMapping) -> Result<(), CoreError>;
    async fn activate_port(&self, port_id: &str) -> Result<(), CoreError>;
    async fn release_port(&self, port_id: &str) -> Result<(), CoreError>;

    async fn insert_task(&self, task: Task) -> Result<(), CoreError>;
    /// Atomically claim the oldest pending task (optionally filtered to one
    /// provider) by moving it to `running` under a row lock.
    async fn claim_next_task(&self, provider_filter: Option<&str>) -> Result<Option<Task>, CoreError>;
    /// Finds an existing `pending` or `running` task of `task_type` for
    /// `instance_id` (spec §4.4 "Idempotency & duplicate submission").
    async fn find_in_flight_task(&self, instance_id: &str, task_type: TaskType) -> Result<Option<Task>, CoreError>;
    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: u8,
        error_message: Option<String>,
    ) -> Result<(), CoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Task, CoreError>;

    async fn upsert_instance(&self, instance: Instance) -> Result<(), CoreError>;
    async fn get_instance(&self, instance_id: &str) -> Result<Instance, CoreError>;
    async fn update_instance_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), CoreError>;
    async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError>;

    /// `INSERT ... ON DUPLICATE KEY UPDATE` on `(instance_id, timestamp)`
    /// (spec §3, §5 ordering guarantees).
    async fn upsert_traffic_record(&self, instance_id: &str, record: TrafficRecord) -> Result<(), CoreError>;

    async fn upsert_traffic_bucket(
        &self,
        scope: TrafficScope,
        resolution: TrafficResolution,
        period_key: String,
        bucket: TrafficHistoryBucket,
    ) -> Result<(), CoreError>;

    /// The most recent record for an instance, if any — the collector's
    /// "previously-recorded maximum" reference point for the conditional
    /// overwrite and gap-fill rules (spec §4.6 step 2-3).
    async fn latest_traffic_record(&self, instance_id: &str) -> Result<Option<TrafficRecord>, CoreError>;

    /// All records for an instance with `timestamp` in `[from, to]`, ordered
    /// ascending — the rollup stage's raw material (spec §4.6 step 5).
    async fn list_traffic_records(
        &self,
        instance_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficRecord>, CoreError>;

    async fn get_pmacct_monitor(&self, instance_id: &str) -> Result<Option<PmacctMonitor>, CoreError>;
    async fn list_enabled_pmacct_monitors(&self) -> Result<Vec<PmacctMonitor>, CoreError>;
    async fn upsert_pmacct_monitor(&self, monitor: PmacctMonitor) -> Result<(), CoreError>;
}
