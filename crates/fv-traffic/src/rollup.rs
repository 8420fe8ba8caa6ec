//! Hourly/daily/monthly rollups and quota enforcement (spec §4.6 step 5 +
//! "Quota enforcement"). Grounded on `fv_core::time`'s hour/day/month key
//! helpers, which already express the "zero the fields below this
//! resolution" shape this module turns into period-key strings.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fv_core::error::CoreError;
use fv_core::model::{Instance, Provider, TrafficHistoryBucket, TrafficRecord, UserQuota};
use fv_core::time;
use fv_storage::{Storage, TrafficResolution, TrafficScope};

pub struct Rollup<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> Rollup<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Recomputes and persists the hourly bucket covering `hour_start`
    /// (spec §4.6 step 5: plain `MAX(rx_bytes), MAX(tx_bytes)`).
    pub async fn refresh_instance_hour(
        &self,
        instance_id: &str,
        hour_start: DateTime<Utc>,
    ) -> Result<TrafficHistoryBucket, CoreError> {
        let records = self
            .storage
            .list_traffic_records(instance_id, hour_start, hour_start + ChronoDuration::hours(1))
            .await?;
        let bucket = hourly_bucket(&records);
        self.storage
            .upsert_traffic_bucket(
                TrafficScope::Instance(instance_id.to_string()),
                TrafficResolution::Hourly,
                period_key(TrafficResolution::Hourly, hour_start),
                bucket,
            )
            .await?;
        Ok(bucket)
    }

    /// Recomputes and persists the daily bucket covering `day_start` (spec
    /// §4.6: a calendar day crosses the pmacct daemon's daily restart, so it
    /// gets the same monotonic-segment treatment as the monthly rollup).
    pub async fn refresh_instance_day(
        &self,
        instance_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<TrafficHistoryBucket, CoreError> {
        let records = self
            .storage
            .list_traffic_records(instance_id, day_start, day_start + ChronoDuration::days(1))
            .await?;
        let bucket = segmented_rollup(&records);
        self.storage
            .upsert_traffic_bucket(
                TrafficScope::Instance(instance_id.to_string()),
                TrafficResolution::Daily,
                period_key(TrafficResolution::Daily, day_start),
                bucket,
            )
            .await?;
        Ok(bucket)
    }

    /// Recomputes and persists the monthly bucket covering `month_start`
    /// (spec §4.6 step 5: partition into monotonic segments split at every
    /// daemon reset, sum the per-segment maxima).
    pub async fn refresh_instance_month(
        &self,
        instance_id: &str,
        month_start: DateTime<Utc>,
    ) -> Result<TrafficHistoryBucket, CoreError> {
        let next_month = add_month(month_start);
        let records = self.storage.list_traffic_records(instance_id, month_start, next_month).await?;
        let bucket = segmented_rollup(&records);
        self.storage
            .upsert_traffic_bucket(
                TrafficScope::Instance(instance_id.to_string()),
                TrafficResolution::Monthly,
                period_key(TrafficResolution::Monthly, month_start),
                bucket,
            )
            .await?;
        Ok(bucket)
    }

    /// Persists an already-aggregated provider or user bucket. Instance
    /// enumeration by provider/user lives outside `Storage`, so the caller
    /// (the queue's batch processor, which already groups work by
    /// `provider_id`) supplies the per-instance buckets to fold together.
    pub async fn refresh_scope(
        &self,
        scope: TrafficScope,
        resolution: TrafficResolution,
        period_key: String,
        instance_buckets: &[TrafficHistoryBucket],
    ) -> Result<TrafficHistoryBucket, CoreError> {
        let bucket = aggregate_buckets(instance_buckets);
        self.storage.upsert_traffic_bucket(scope, resolution, period_key, bucket).await?;
        Ok(bucket)
    }
}

fn hourly_bucket(records: &[TrafficRecord]) -> TrafficHistoryBucket {
    TrafficHistoryBucket {
        rx_bytes: records.iter().map(|r| r.rx_bytes).max().unwrap_or(0),
        tx_bytes: records.iter().map(|r| r.tx_bytes).max().unwrap_or(0),
    }
}

/// Splits `records` (ascending by timestamp) wherever either counter
/// decreases relative to the previous record — the daemon restarting and its
/// cumulative counters dropping back to near zero — and sums the maximum of
/// each resulting segment.
fn segmented_rollup(records: &[TrafficRecord]) -> TrafficHistoryBucket {
    let Some(first) = records.first() else {
        return TrafficHistoryBucket { rx_bytes: 0, tx_bytes: 0 };
    };

    let mut total_rx = 0u64;
    let mut total_tx = 0u64;
    let mut seg_max_rx = first.rx_bytes;
    let mut seg_max_tx = first.tx_bytes;

    for pair in records.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.rx_bytes < prev.rx_bytes || cur.tx_bytes < prev.tx_bytes {
            total_rx += seg_max_rx;
            total_tx += seg_max_tx;
            seg_max_rx = cur.rx_bytes;
            seg_max_tx = cur.tx_bytes;
        } else {
            seg_max_rx = seg_max_rx.max(cur.rx_bytes);
            seg_max_tx = seg_max_tx.max(cur.tx_bytes);
        }
    }

    total_rx += seg_max_rx;
    total_tx += seg_max_tx;
    TrafficHistoryBucket { rx_bytes: total_rx, tx_bytes: total_tx }
}

fn aggregate_buckets(buckets: &[TrafficHistoryBucket]) -> TrafficHistoryBucket {
    buckets.iter().fold(TrafficHistoryBucket { rx_bytes: 0, tx_bytes: 0 }, |acc, b| TrafficHistoryBucket {
        rx_bytes: acc.rx_bytes + b.rx_bytes,
        tx_bytes: acc.tx_bytes + b.tx_bytes,
    })
}

fn period_key(resolution: TrafficResolution, ts: DateTime<Utc>) -> String {
    match resolution {
        TrafficResolution::Hourly => {
            let (y, m, d, h) = time::hour_key(ts);
            format!("{y:04}-{m:02}-{d:02}-{h:02}")
        }
        TrafficResolution::Daily => {
            let (y, m, d, _) = time::day_key(ts);
            format!("{y:04}-{m:02}-{d:02}")
        }
        TrafficResolution::Monthly => {
            let (y, m, _, _) = time::month_key(ts);
            format!("{y:04}-{m:02}")
        }
    }
}

fn add_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Datelike;
    let (year, month) = if ts.month() == 12 { (ts.year() + 1, 1) } else { (ts.year(), ts.month() + 1) };
    ts.with_year(year).and_then(|d| d.with_month(month)).unwrap_or(ts)
}

/// Sets or clears `instance.traffic_limited`/`traffic_limit_reason` from the
/// provider's and the owning user's quota state (spec §4.6 "Quota
/// enforcement"). Returns whether the instance's limited state changed.
pub fn enforce_quota(instance: &mut Instance, provider: &Provider, user_quota: &UserQuota) -> bool {
    let reason = if provider.traffic_exhausted() {
        Some("provider traffic quota exhausted".to_string())
    } else if user_quota.used_traffic_bytes >= user_quota.total_traffic_bytes {
        Some("user traffic quota exhausted".to_string())
    } else {
        None
    };

    let changed = instance.traffic_limited != reason.is_some() || instance.traffic_limit_reason != reason;
    instance.traffic_limited = reason.is_some();
    instance.traffic_limit_reason = reason;
    changed
}

/// Clears an instance's limited state and the provider's/user's traffic
/// counters at the start of a new billing month (spec §4.6: "monthly reset
/// clears flag+counters").
pub fn reset_monthly(instance: &mut Instance, provider: &mut Provider, user_quota: &mut UserQuota) {
    instance.traffic_limited = false;
    instance.traffic_limit_reason = None;
    provider.used_traffic_bytes = 0;
    user_quota.used_traffic_bytes = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fv_core::model::{ExecutionRule, NetworkType, ProviderType, ResourceAmounts};

    fn record(minute: u32, rx: u64, tx: u64) -> TrafficRecord {
        TrafficRecord { timestamp: Utc.with_ymd_and_hms(2024, 5, 10, 3, minute, 0).unwrap(), rx_bytes: rx, tx_bytes: tx }
    }

    #[test]
    fn hourly_bucket_is_plain_max() {
        let records = vec![record(0, 100, 200), record(5, 150, 250), record(10, 120, 180)];
        let bucket = hourly_bucket(&records);
        assert_eq!(bucket.rx_bytes, 150);
        assert_eq!(bucket.tx_bytes, 250);
    }

    #[test]
    fn segmented_rollup_sums_across_a_daemon_reset() {
        let records = vec![record(55, 500, 500), record(60, 5, 5)];
        let bucket = segmented_rollup(&records);
        assert_eq!(bucket.rx_bytes, 505);
        assert_eq!(bucket.tx_bytes, 505);
    }

    #[test]
    fn segmented_rollup_takes_only_the_final_maximum_within_one_segment() {
        let records = vec![record(0, 10, 10), record(5, 50, 50), record(10, 40, 200)];
        let bucket = segmented_rollup(&records);
        assert_eq!(bucket.rx_bytes, 50);
        assert_eq!(bucket.tx_bytes, 200);
    }

    #[test]
    fn segmented_rollup_handles_multiple_resets() {
        let records = vec![record(0, 300, 300), record(5, 10, 10), record(10, 20, 20), record(15, 3, 3)];
        let bucket = segmented_rollup(&records);
        assert_eq!(bucket.rx_bytes, 300 + 20 + 3);
        assert_eq!(bucket.tx_bytes, 300 + 20 + 3);
    }

    #[test]
    fn period_key_formats_each_resolution() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 3, 0, 0).unwrap();
        assert_eq!(period_key(TrafficResolution::Hourly, ts), "2024-05-10-03");
        assert_eq!(period_key(TrafficResolution::Daily, ts), "2024-05-10");
        assert_eq!(period_key(TrafficResolution::Monthly, ts), "2024-05");
    }

    #[test]
    fn add_month_rolls_over_the_year() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let next = add_month(ts);
        assert_eq!(next.year(), 2025);
        assert_eq!(next.month(), 1);
    }

    fn blank_instance() -> Instance {
        Instance {
            id: "i-1".into(),
            name: "test".into(),
            provider_id: "p-1".into(),
            user_id: "u-1".into(),
            instance_type: fv_core::model::InstanceType::Vm,
            image: "alpine".into(),
            os_type: "linux".into(),
            resources: ResourceAmounts::default(),
            private_ip: None,
            public_ip: None,
            ipv6_address: None,
            public_ipv6: None,
            ssh_port: None,
            username: None,
            password: None,
            status: fv_core::model::InstanceStatus::Running,
            max_traffic_bytes: None,
            traffic_limited: false,
            traffic_limit_reason: None,
            pmacct_interface_v4: None,
            pmacct_interface_v6: None,
            vmid: None,
            expires_at: None,
            is_manual_expiry: false,
            created_at: Utc::now(),
        }
    }

    fn blank_provider() -> Provider {
        Provider {
            id: "p-1".into(),
            name: "test".into(),
            provider_type: ProviderType::Proxmox,
            endpoint: "https://host".into(),
            port: 0,
            credentials: fv_core::model::ProviderCredentials { password: None, private_key: None, api_token: None, tls_cert: None },
            network_type: NetworkType::NatIpv4,
            ipv4_port_mapping_method: fv_core::model::PortMappingMethod::Native,
            ipv6_port_mapping_method: fv_core::model::PortMappingMethod::Native,
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

    fn blank_user_quota() -> UserQuota {
        UserQuota {
            user_id: "u-1".into(),
            level: 1,
            max_instances: 10,
            max_resources: ResourceAmounts::default(),
            used: ResourceAmounts::default(),
            used_instances: 0,
            pending: ResourceAmounts::default(),
            pending_instances: 0,
            total_traffic_bytes: 1_000_000,
            used_traffic_bytes: 0,
        }
    }

    #[test]
    fn enforce_quota_limits_on_provider_exhaustion() {
        let mut instance = blank_instance();
        let mut provider = blank_provider();
        provider.traffic_limit_bytes = Some(100);
        provider.used_traffic_bytes = 100;
        let user_quota = blank_user_quota();

        assert!(enforce_quota(&mut instance, &provider, &user_quota));
        assert!(instance.traffic_limited);
        assert_eq!(instance.traffic_limit_reason.as_deref(), Some("provider traffic quota exhausted"));
    }

    #[test]
    fn enforce_quota_limits_on_user_exhaustion() {
        let mut instance = blank_instance();
        let provider = blank_provider();
        let mut user_quota = blank_user_quota();
        user_quota.used_traffic_bytes = user_quota.total_traffic_bytes;

        assert!(enforce_quota(&mut instance, &provider, &user_quota));
        assert_eq!(instance.traffic_limit_reason.as_deref(), Some("user traffic quota exhausted"));
    }

    #[test]
    fn enforce_quota_clears_when_under_both_limits() {
        let mut instance = blank_instance();
        instance.traffic_limited = true;
        instance.traffic_limit_reason = Some("provider traffic quota exhausted".to_string());
        let provider = blank_provider();
        let user_quota = blank_user_quota();

        assert!(enforce_quota(&mut instance, &provider, &user_quota));
        assert!(!instance.traffic_limited);
        assert!(instance.traffic_limit_reason.is_none());
    }

    #[test]
    fn reset_monthly_clears_flags_and_counters() {
        let mut instance = blank_instance();
        instance.traffic_limited = true;
        instance.traffic_limit_reason = Some("provider traffic quota exhausted".to_string());
        let mut provider = blank_provider();
        provider.used_traffic_bytes = 500;
        let mut user_quota = blank_user_quota();
        user_quota.used_traffic_bytes = 900_000;

        reset_monthly(&mut instance, &mut provider, &mut user_quota);

        assert!(!instance.traffic_limited);
        assert!(instance.traffic_limit_reason.is_none());
        assert_eq!(provider.used_traffic_bytes, 0);
        assert_eq!(user_quota.used_traffic_bytes, 0);
    }
}
