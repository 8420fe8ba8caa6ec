//! Adaptive batch processor (spec §4.8, component C8): drains the two
//! [`TaskQueue`] lanes, partitions by `provider_id`, and processes each
//! partition with a concurrency level that scales with its size. Uses the
//! same `Semaphore`-bounded, `tokio::time::interval`-driven poll loop as
//! `fv_traffic::collector`, with a `watch::channel` shutdown signal fanned
//! out to every worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fv_core::error::CoreError;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::queue::{QueueItem, TaskQueue};

/// Once both lanes have been empty this long, the loop backs off to a
/// 10-second tick (spec §4.8 "idle policy").
const IDLE_THRESHOLD: Duration = Duration::from_secs(60);
const IDLE_TICK: Duration = Duration::from_secs(10);
/// Processing interval while busy (spec §4.8: "30s idle -> 5s at >100 items").
const BUSY_INTERVAL: Duration = Duration::from_secs(30);
const HOT_INTERVAL: Duration = Duration::from_secs(5);
const HOT_DEPTH: usize = 100;
/// Overflow slots for work that bypasses the queue entirely (spec §4.8:
/// "a 10-slot semaphore for degraded goroutines with strict timeouts").
const OVERFLOW_SLOTS: usize = 10;
const OVERFLOW_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `Stop()`-equivalent shutdown waits for in-flight partitions.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(60);

/// What a handler does with one dequeued item. Implemented by
/// `fv_queue::traffic::TrafficJobHandler` for the concrete traffic/monitor
/// payloads; kept as a trait so the processing/backoff/shutdown machinery
/// below has no dependency on what the jobs actually do.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, item: QueueItem) -> Result<(), CoreError>;
}

/// Dynamic concurrency tier for a partition of this size (spec §4.8: "≤5 ->
/// 1; ≤20 -> 3; ≤50 -> 5; else -> 10").
fn concurrency_for(partition_size: usize) -> usize {
    match partition_size {
        0..=5 => 1,
        6..=20 => 3,
        21..=50 => 5,
        _ => 10,
    }
}

/// Processing interval for the next busy cycle, given the total depth just
/// drained across both lanes.
fn interval_for(depth: usize) -> Duration {
    if depth > HOT_DEPTH {
        HOT_INTERVAL
    } else {
        BUSY_INTERVAL
    }
}

pub struct BatchProcessor<H: JobHandler> {
    queue: Arc<TaskQueue>,
    handler: Arc<H>,
    overflow: Arc<Semaphore>,
}

impl<H: JobHandler + 'static> BatchProcessor<H> {
    pub fn new(queue: Arc<TaskQueue>, handler: Arc<H>) -> Self {
        Self { queue, handler, overflow: Arc::new(Semaphore::new(OVERFLOW_SLOTS)) }
    }

    /// Runs the idle/busy loop until `shutdown` carries `true`, then waits
    /// up to 60s for whatever partitions are still running before returning
    /// (spec §4.8: `Stop()` waits up to 60s, then logs pending counts).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut idle_since: Option<Instant> = None;
        let mut rounds: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.queue.is_idle() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                let tick = if since.elapsed() >= IDLE_THRESHOLD { IDLE_TICK } else { BUSY_INTERVAL };
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    changed = shutdown.changed() => if changed.is_err() { break; },
                }
                continue;
            }
            idle_since = None;

            let depth = self.queue.depth();
            let items = self.queue.drain_all();
            let this = self.clone();
            rounds.spawn(async move { this.process_partitioned(items).await });

            // Cap how many drain-rounds can overlap so a very bursty queue
            // can't spawn unbounded partition trees.
            while rounds.len() > 4 {
                rounds.join_next().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval_for(depth)) => {}
                changed = shutdown.changed() => if changed.is_err() { break; },
            }
        }

        self.drain_on_shutdown(rounds).await;
    }

    async fn drain_on_shutdown(&self, mut rounds: JoinSet<()>) {
        info!(pending_rounds = rounds.len(), queue_depth = self.queue.depth(), "batch processor stopping");
        let deadline = tokio::time::sleep(SHUTDOWN_DRAIN);
        tokio::pin!(deadline);
        loop {
            if rounds.is_empty() {
                return;
            }
            tokio::select! {
                joined = rounds.join_next() => {
                    if joined.is_none() {
                        return;
                    }
                }
                _ = &mut deadline => {
                    warn!(
                        pending_rounds = rounds.len(),
                        pending_queue_depth = self.queue.depth(),
                        "shutdown drain timed out, aborting remaining partitions"
                    );
                    rounds.abort_all();
                    return;
                }
            }
        }
    }

    async fn process_partitioned(self: Arc<Self>, items: Vec<QueueItem>) {
        let mut by_provider: HashMap<String, Vec<QueueItem>> = HashMap::new();
        for item in items {
            by_provider.entry(item.provider_id.clone()).or_default().push(item);
        }

        let mut partitions: JoinSet<()> = JoinSet::new();
        for (_, partition) in by_provider {
            let this = self.clone();
            partitions.spawn(async move { this.process_partition(partition).await });
        }
        while partitions.join_next().await.is_some() {}
    }

    async fn process_partition(self: Arc<Self>, items: Vec<QueueItem>) {
        let limiter = Arc::new(Semaphore::new(concurrency_for(items.len())));
        let mut tasks: JoinSet<()> = JoinSet::new();
        for item in items {
            let permit = limiter.clone().acquire_owned().await.expect("partition semaphore closed");
            let handler = self.handler.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = handler.handle(item).await {
                    warn!(error = %err, "queue item processing failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Handles `item` immediately through the overflow semaphore rather than
    /// the queue, for callers that can't wait for the next drain cycle. Drops
    /// the item (logged) if no slot frees up within the strict timeout (spec
    /// §4.8: "beyond that, new items are logged and dropped").
    pub async fn handle_overflow(&self, item: QueueItem) -> Result<(), CoreError> {
        let permit = match timeout(OVERFLOW_TIMEOUT, self.overflow.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(provider_id = %item.provider_id, "overflow capacity exhausted, dropping item");
                return Err(CoreError::CapacityExhausted { dimension: "queue_overflow".to_string() });
            }
        };
        let result = self.handler.handle(item).await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Payload, QueueLane};
    use fv_core::model::PmacctMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _item: QueueItem) -> Result<(), CoreError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn item(provider_id: &str) -> QueueItem {
        QueueItem::new(provider_id, Payload::DeleteMonitor {
            monitor: PmacctMonitor {
                instance_id: "i-1".into(),
                provider_id: provider_id.into(),
                mapped_ip: None,
                mapped_ipv6: None,
                is_enabled: false,
                last_sync: None,
            },
        })
    }

    #[test]
    fn concurrency_tiers_match_the_documented_bounds() {
        assert_eq!(concurrency_for(1), 1);
        assert_eq!(concurrency_for(5), 1);
        assert_eq!(concurrency_for(6), 3);
        assert_eq!(concurrency_for(20), 3);
        assert_eq!(concurrency_for(21), 5);
        assert_eq!(concurrency_for(50), 5);
        assert_eq!(concurrency_for(51), 10);
    }

    #[test]
    fn interval_drops_once_the_queue_gets_hot() {
        assert_eq!(interval_for(10), BUSY_INTERVAL);
        assert_eq!(interval_for(100), BUSY_INTERVAL);
        assert_eq!(interval_for(101), HOT_INTERVAL);
    }

    #[tokio::test]
    async fn run_processes_queued_items_then_stops_on_shutdown() {
        let queue = Arc::new(TaskQueue::new());
        queue.push(QueueLane::Collect, item("p-1"));
        queue.push(QueueLane::Mutate, item("p-2"));

        let handler = Arc::new(CountingHandler { handled: AtomicUsize::new(0) });
        let processor = Arc::new(BatchProcessor::new(queue.clone(), handler.clone()));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(rx));

        // Give the busy cycle a chance to drain and dispatch both items.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handle_overflow_runs_the_handler_directly() {
        let queue = Arc::new(TaskQueue::new());
        let handler = Arc::new(CountingHandler { handled: AtomicUsize::new(0) });
        let processor = BatchProcessor::new(queue, handler.clone());

        processor.handle_overflow(item("p-1")).await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }
}
