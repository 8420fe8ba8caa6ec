//! Per-cycle collection from a remote `pmacctd` SQLite DB (spec §4.6
//! "Collection"). Grounded on
//! `other_examples/.../NexusQuantum-NQRust-MicroVM__apps-manager-src-features-metrics-collector.rs`'s
//! poll-one-source-per-iteration, log-and-continue-on-error shape, transplanted
//! from an HTTP guest agent onto a `sqlite3` query run over `fv-ssh`; the
//! upsert-with-dedup batching follows its sibling `metrics-repo.rs`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fv_core::error::CoreError;
use fv_core::model::{PmacctMonitor, TrafficRecord};
use fv_provider::NodeConfig;
use fv_ssh::SshPool;
use fv_storage::Storage;
use tracing::{debug, info, warn};

/// Rows are upserted in groups of this size (spec §4.6 step 2: "50 per
/// transaction"). The narrow `Storage` trait has no explicit transaction
/// handle, so this bounds how much work happens between `.await` points
/// rather than a literal SQL transaction.
const BATCH_SIZE: usize = 50;

/// A row is eligible for overwrite even when its value didn't grow, as long
/// as it's younger than this (spec §4.6 step 2: "lets retries correct very
/// recent data without undoing history").
const RECENT_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

pub struct Collector<S: Storage> {
    storage: Arc<S>,
    ssh: Arc<SshPool>,
}

impl<S: Storage> Collector<S> {
    pub fn new(storage: Arc<S>, ssh: Arc<SshPool>) -> Self {
        Self { storage, ssh }
    }

    /// Runs one collection cycle for a single enabled monitor (spec §4.6 steps
    /// 1-4). Returns the number of rows written, including synthesized
    /// gap-fill rows.
    pub async fn collect_one(&self, node: &NodeConfig, monitor: &PmacctMonitor) -> Result<usize, CoreError> {
        let raw = self.ssh.exec_stdout(&node.ssh, &cumulative_query(monitor))?;
        let new_records = parse_csv_rows(&raw);
        if new_records.is_empty() {
            debug!(instance_id = %monitor.instance_id, "collection cycle produced no rows");
            return Ok(0);
        }

        let prior_latest = self.storage.latest_traffic_record(&monitor.instance_id).await?;
        let now = Utc::now();

        let first_ts = new_records.first().expect("checked non-empty above").timestamp;
        let last_ts = new_records.last().expect("checked non-empty above").timestamp;
        let existing = self.storage.list_traffic_records(&monitor.instance_id, first_ts, last_ts).await?;

        let mut to_write = Vec::with_capacity(new_records.len());
        for candidate in &new_records {
            let existing_at_ts = existing.iter().find(|r| r.timestamp == candidate.timestamp);
            if should_overwrite(existing_at_ts, candidate, now) {
                to_write.push(*candidate);
            }
        }

        if gap_fill_applies(prior_latest.as_ref(), &new_records) {
            let prior = prior_latest.as_ref().expect("checked Some above");
            let synthesized = synthesize_gap_rows(prior, first_ts);
            info!(
                instance_id = %monitor.instance_id,
                rows = synthesized.len(),
                "synthesizing gap-fill rows across collector downtime"
            );
            to_write.splice(0..0, synthesized);
        }

        let mut written = 0usize;
        for chunk in to_write.chunks(BATCH_SIZE) {
            for record in chunk {
                self.storage.upsert_traffic_record(&monitor.instance_id, *record).await?;
                written += 1;
            }
        }

        if written > 0 {
            let mut updated = monitor.clone();
            updated.last_sync = Some(now);
            self.storage.upsert_pmacct_monitor(updated).await?;
        }

        Ok(written)
    }

    /// Drives one cycle for every enabled monitor, logging and continuing past
    /// a single monitor's failure rather than aborting the whole sweep.
    pub async fn collect_all(&self, nodes: &[(NodeConfig, PmacctMonitor)]) -> usize {
        let mut total = 0usize;
        for (node, monitor) in nodes {
            match self.collect_one(node, monitor).await {
                Ok(n) => total += n,
                Err(err) => warn!(instance_id = %monitor.instance_id, error = %err, "traffic collection cycle failed"),
            }
        }
        total
    }
}

/// The window-function query of spec §4.6 step 1: per-5-minute-slot byte
/// sums, then a running cumulative total ordered by slot, restricted to the
/// monitor's mapped v4/v6 addresses.
fn cumulative_query(monitor: &PmacctMonitor) -> String {
    let mut hosts = Vec::new();
    if let Some(ip) = &monitor.mapped_ip {
        hosts.push(format!("'{ip}'"));
    }
    if let Some(ip6) = &monitor.mapped_ipv6 {
        hosts.push(format!("'{ip6}'"));
    }
    let host_list = hosts.join(", ");
    let db = format!("/var/lib/pmacct/{}/traffic.db", monitor.instance_id);

    format!(
        "sqlite3 -csv {db} \"WITH slots AS ( \
           SELECT (CAST(strftime('%s', stamp_inserted) AS INTEGER) / 300) * 300 AS slot_epoch, \
                  SUM(CASE WHEN ip_dst IN ({host_list}) THEN bytes ELSE 0 END) AS rx_bytes, \
                  SUM(CASE WHEN ip_src IN ({host_list}) THEN bytes ELSE 0 END) AS tx_bytes \
           FROM acct_v9 WHERE ip_src IN ({host_list}) OR ip_dst IN ({host_list}) GROUP BY slot_epoch \
         ) SELECT datetime(slot_epoch, 'unixepoch'), \
                  SUM(rx_bytes) OVER (ORDER BY slot_epoch), \
                  SUM(tx_bytes) OVER (ORDER BY slot_epoch) \
           FROM slots ORDER BY slot_epoch;\""
    )
}

fn parse_csv_rows(raw: &str) -> Vec<TrafficRecord> {
    let mut rows: Vec<TrafficRecord> = raw
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let ts_str = parts.next()?.trim();
            let rx_str = parts.next()?.trim();
            let tx_str = parts.next()?.trim();
            let timestamp = DateTime::parse_from_str(&format!("{ts_str} +0000"), "%Y-%m-%d %H:%M:%S %z")
                .ok()
                .map(|dt| dt.with_timezone(&Utc))?;
            let rx_bytes = rx_str.parse().ok()?;
            let tx_bytes = tx_str.parse().ok()?;
            Some(TrafficRecord { timestamp, rx_bytes, tx_bytes })
        })
        .collect();
    rows.sort_by_key(|r| r.timestamp);
    rows
}

/// Spec §4.6 step 2's conditional overwrite: only replace an existing row when
/// the new value is larger, or the existing row is still recent enough that a
/// retry correcting it is plausible.
fn should_overwrite(existing: Option<&TrafficRecord>, candidate: &TrafficRecord, now: DateTime<Utc>) -> bool {
    match existing {
        None => true,
        Some(existing) => candidate.total_bytes() >= existing.total_bytes() || now - existing.timestamp < RECENT_WINDOW,
    }
}

/// Spec §4.6 step 3: gap-fill only kicks in when every fresh row is at least
/// as large as the last previously-recorded maximum, and that prior record was
/// non-zero (otherwise there's nothing meaningful to carry forward).
fn gap_fill_applies(prior: Option<&TrafficRecord>, new_records: &[TrafficRecord]) -> bool {
    match prior {
        Some(prior) if prior.total_bytes() > 0 => new_records.iter().all(|r| r.total_bytes() >= prior.total_bytes()),
        _ => false,
    }
}

/// Synthesizes 1-minute-granularity rows carrying `prior`'s value forward
/// across `[prior.timestamp + 1min, first_new_timestamp - 1min]`.
fn synthesize_gap_rows(prior: &TrafficRecord, first_new_timestamp: DateTime<Utc>) -> Vec<TrafficRecord> {
    let mut rows = Vec::new();
    let mut ts = prior.timestamp + ChronoDuration::minutes(1);
    while ts < first_new_timestamp {
        rows.push(TrafficRecord {
            timestamp: ts,
            rx_bytes: prior.rx_bytes,
            tx_bytes: prior.tx_bytes,
        });
        ts += ChronoDuration::minutes(1);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 3, minute, 0).unwrap()
    }

    #[test]
    fn parse_csv_rows_handles_sqlite_datetime_output() {
        let raw = "2024-05-10 03:55:00,1000,2000\n2024-05-10 04:00:00,1500,2500\n";
        let rows = parse_csv_rows(raw);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rx_bytes, 1000);
        assert_eq!(rows[1].tx_bytes, 2500);
    }

    #[test]
    fn should_overwrite_when_new_value_is_larger() {
        let existing = TrafficRecord { timestamp: ts(0), rx_bytes: 100, tx_bytes: 100 };
        let candidate = TrafficRecord { timestamp: ts(0), rx_bytes: 200, tx_bytes: 200 };
        assert!(should_overwrite(Some(&existing), &candidate, ts(10)));
    }

    #[test]
    fn should_not_overwrite_smaller_value_on_old_row() {
        let existing = TrafficRecord { timestamp: ts(0), rx_bytes: 100, tx_bytes: 100 };
        let candidate = TrafficRecord { timestamp: ts(0), rx_bytes: 50, tx_bytes: 50 };
        let now = existing.timestamp + ChronoDuration::minutes(10);
        assert!(!should_overwrite(Some(&existing), &candidate, now));
    }

    #[test]
    fn should_overwrite_smaller_value_on_recent_row() {
        let existing = TrafficRecord { timestamp: ts(0), rx_bytes: 100, tx_bytes: 100 };
        let candidate = TrafficRecord { timestamp: ts(0), rx_bytes: 50, tx_bytes: 50 };
        let now = existing.timestamp + ChronoDuration::minutes(2);
        assert!(should_overwrite(Some(&existing), &candidate, now));
    }

    #[test]
    fn gap_fill_skipped_when_prior_is_zero() {
        let prior = TrafficRecord { timestamp: ts(0), rx_bytes: 0, tx_bytes: 0 };
        let new_records = vec![TrafficRecord { timestamp: ts(20), rx_bytes: 10, tx_bytes: 10 }];
        assert!(!gap_fill_applies(Some(&prior), &new_records));
    }

    #[test]
    fn gap_fill_skipped_when_a_new_row_regresses() {
        let prior = TrafficRecord { timestamp: ts(0), rx_bytes: 500, tx_bytes: 500 };
        let new_records = vec![TrafficRecord { timestamp: ts(20), rx_bytes: 5, tx_bytes: 5 }];
        assert!(!gap_fill_applies(Some(&prior), &new_records));
    }

    #[test]
    fn gap_fill_applies_when_all_new_rows_meet_or_exceed_the_prior_maximum() {
        let prior = TrafficRecord { timestamp: ts(0), rx_bytes: 500, tx_bytes: 500 };
        let new_records = vec![TrafficRecord { timestamp: ts(20), rx_bytes: 600, tx_bytes: 600 }];
        assert!(gap_fill_applies(Some(&prior), &new_records));
    }

    #[test]
    fn synthesize_gap_rows_bridges_the_full_interior_at_one_minute_granularity() {
        let prior = TrafficRecord { timestamp: ts(0), rx_bytes: 500, tx_bytes: 500 };
        let rows = synthesize_gap_rows(&prior, ts(5));
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].timestamp, ts(1));
        assert_eq!(rows.last().unwrap().timestamp, ts(4));
        assert!(rows.iter().all(|r| r.rx_bytes == 500 && r.tx_bytes == 500));
    }
}
