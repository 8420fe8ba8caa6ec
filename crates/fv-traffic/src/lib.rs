//! Per-instance `pmacct` traffic monitoring (spec §4.6, component C6):
//! install a monitor on a freshly networked instance, pull its counters on a
//! cycle, roll the raw records up into hourly/daily/monthly history, and
//! enforce provider/user traffic quotas. Grounded on `fv-network`'s
//! `Storage`-plus-`SshPool`-wrapping-struct shape for the engine below, with
//! the collection loop itself grounded on the two metrics-pipeline files
//! named in `collector.rs`.

pub mod collector;
pub mod pmacct;
pub mod rollup;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use fv_core::error::CoreError;
use fv_core::model::{Instance, PmacctMonitor, Provider, TrafficHistoryBucket, UserQuota};
use fv_provider::NodeConfig;
use fv_ssh::SshPool;
use fv_storage::{Storage, TrafficResolution, TrafficScope};
use tracing::instrument;

pub use collector::Collector;
pub use rollup::Rollup;

/// Ties monitor installation, per-cycle collection and rollups together
/// behind one handle, the way [`fv_network::NetworkConfigurator`] wraps the
/// network-configuration procedure.
pub struct TrafficEngine<S: Storage> {
    storage: Arc<S>,
    ssh: Arc<SshPool>,
    collector: Collector<S>,
    rollup: Rollup<S>,
}

impl<S: Storage> TrafficEngine<S> {
    pub fn new(storage: Arc<S>, ssh: Arc<SshPool>) -> Self {
        let collector = Collector::new(storage.clone(), ssh.clone());
        let rollup = Rollup::new(storage.clone());
        Self { storage, ssh, collector, rollup }
    }

    /// Installs a `pmacctd` monitor on `instance` and registers it as enabled
    /// (spec §4.6 "Installation").
    #[instrument(skip(self, node, instance), fields(instance_id = %instance.id))]
    pub async fn install(&self, node: &NodeConfig, instance: &Instance, device: &str) -> Result<(), CoreError> {
        pmacct::install(&self.ssh, &node.ssh, instance, device)?;
        self.storage
            .upsert_pmacct_monitor(PmacctMonitor {
                instance_id: instance.id.clone(),
                provider_id: instance.provider_id.clone(),
                mapped_ip: instance.private_ip.clone(),
                mapped_ipv6: instance.public_ipv6.clone(),
                is_enabled: true,
                last_sync: None,
            })
            .await
    }

    /// Runs one collection cycle over every enabled monitor (spec §4.6
    /// "Collection"). Each `(node, monitor)` pair in `targets` should
    /// correspond to a currently-enabled [`PmacctMonitor`] from
    /// [`Storage::list_enabled_pmacct_monitors`].
    pub async fn collect_all(&self, targets: &[(NodeConfig, PmacctMonitor)]) -> usize {
        self.collector.collect_all(targets).await
    }

    /// Runs one collection cycle for a single monitor, for callers (the
    /// task queue's batch processor) that dispatch monitors individually
    /// rather than as a batch.
    pub async fn collect_one(&self, node: &NodeConfig, monitor: &PmacctMonitor) -> Result<usize, CoreError> {
        self.collector.collect_one(node, monitor).await
    }

    /// Recomputes and persists the hourly/daily/monthly instance buckets
    /// covering `at` (spec §4.6 "Rollups").
    pub async fn refresh_instance_rollups(&self, instance_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.rollup.refresh_instance_hour(instance_id, truncate_to_hour(at)).await?;
        self.rollup.refresh_instance_day(instance_id, truncate_to_day(at)).await?;
        self.rollup.refresh_instance_month(instance_id, truncate_to_month(at)).await?;
        Ok(())
    }

    /// Aggregates already-computed instance buckets into a provider- or
    /// user-scoped bucket (spec §4.6: "provider/user rollups aggregate from
    /// instance rollups"). Instance enumeration by provider/user is left to
    /// the caller, since `Storage` has no such listing method.
    pub async fn refresh_scope_rollup(
        &self,
        scope: TrafficScope,
        resolution: TrafficResolution,
        period_key: String,
        instance_buckets: &[TrafficHistoryBucket],
    ) -> Result<TrafficHistoryBucket, CoreError> {
        self.rollup.refresh_scope(scope, resolution, period_key, instance_buckets).await
    }

    /// Persists `monitor` as given (spec §4.6/§4.8: bulk monitor deletes
    /// disable rather than remove the row, since `Storage` has no monitor
    /// delete method — only `upsert_pmacct_monitor`).
    pub async fn disable_monitor(&self, monitor: PmacctMonitor) -> Result<(), CoreError> {
        self.storage.upsert_pmacct_monitor(monitor).await
    }

    /// Evaluates and persists a single instance's traffic-limited state
    /// against its provider's and owner's quotas (spec §4.6 "Quota
    /// enforcement"), returning whether it changed. The caller drives this
    /// per instance since `Storage` has no "list instances by provider/user"
    /// method to enumerate a quota's affected instances directly.
    pub async fn enforce_quota_one(
        &self,
        instance_id: &str,
        provider: &Provider,
        user_quota: &UserQuota,
    ) -> Result<bool, CoreError> {
        let mut instance = self.storage.get_instance(instance_id).await?;
        let changed = rollup::enforce_quota(&mut instance, provider, user_quota);
        if changed {
            self.storage.upsert_instance(instance).await?;
        }
        Ok(changed)
    }
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_hour(ts).with_hour(0).unwrap()
}

fn truncate_to_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_day(ts).with_day(1).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncate_helpers_zero_out_the_expected_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 3, 57, 42).unwrap();
        assert_eq!(truncate_to_hour(ts), Utc.with_ymd_and_hms(2024, 5, 10, 3, 0, 0).unwrap());
        assert_eq!(truncate_to_day(ts), Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
        assert_eq!(truncate_to_month(ts), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }
}
