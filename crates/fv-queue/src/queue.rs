//! Bounded work queues (spec §4.8): two size-500 lanes shared by the traffic
//! pipeline and bulk monitor add/delete, so a burst in one never starves the
//! other. Grounded on `fv_provider::http_transport::TransportRegistry`'s
//! plain `std::sync::Mutex`-guarded table — these queues are drained
//! synchronously under the lock too, never held across an `.await`.

use std::collections::VecDeque;
use std::sync::Mutex;

use fv_core::model::{Instance, PmacctMonitor};
use fv_provider::NodeConfig;

/// Capacity of each lane (spec §4.8: "two bounded queues (size 500)").
pub const QUEUE_CAPACITY: usize = 500;

/// Work a queued item carries. `DeleteMonitor` disables rather than hard
/// deletes, since `Storage` exposes no monitor-delete method — only
/// `upsert_pmacct_monitor`, which this treats as "upsert with
/// `is_enabled: false`".
#[derive(Debug, Clone)]
pub enum Payload {
    CollectTraffic { node: NodeConfig, monitor: PmacctMonitor },
    AddMonitor { node: NodeConfig, instance: Instance, device: String },
    DeleteMonitor { monitor: PmacctMonitor },
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub provider_id: String,
    pub payload: Payload,
}

impl QueueItem {
    pub fn new(provider_id: impl Into<String>, payload: Payload) -> Self {
        Self { provider_id: provider_id.into(), payload }
    }
}

/// Which lane an item belongs to (spec §4.8's "two bounded queues").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLane {
    /// Periodic traffic-collection jobs, fed by the traffic pipeline.
    Collect,
    /// Bulk monitor add/delete requests.
    Mutate,
}

/// Whether an enqueue succeeded or was rejected because the lane is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Dropped,
}

struct BoundedQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), capacity }
    }

    fn try_push(&self, item: QueueItem) -> bool {
        let mut guard = self.items.lock().expect("queue mutex poisoned");
        if guard.len() >= self.capacity {
            return false;
        }
        guard.push_back(item);
        true
    }

    fn drain(&self) -> Vec<QueueItem> {
        self.items.lock().expect("queue mutex poisoned").drain(..).collect()
    }

    fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }
}

/// The two lanes the batch processor drains together.
pub struct TaskQueue {
    collect: BoundedQueue,
    mutate: BoundedQueue,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self { collect: BoundedQueue::new(QUEUE_CAPACITY), mutate: BoundedQueue::new(QUEUE_CAPACITY) }
    }

    pub fn push(&self, lane: QueueLane, item: QueueItem) -> EnqueueOutcome {
        let accepted = match lane {
            QueueLane::Collect => self.collect.try_push(item),
            QueueLane::Mutate => self.mutate.try_push(item),
        };
        if accepted {
            EnqueueOutcome::Accepted
        } else {
            EnqueueOutcome::Dropped
        }
    }

    pub fn is_idle(&self) -> bool {
        self.collect.len() == 0 && self.mutate.len() == 0
    }

    /// Total items waiting across both lanes, used to scale the processing
    /// interval (spec §4.8: "scales inversely with queue depth").
    pub fn depth(&self) -> usize {
        self.collect.len() + self.mutate.len()
    }

    /// Drains both lanes; the caller partitions the result by `provider_id`.
    pub fn drain_all(&self) -> Vec<QueueItem> {
        let mut items = self.collect.drain();
        items.extend(self.mutate.drain());
        items
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn push_respects_per_lane_capacity() {
        let small = BoundedQueue::new(2);
        assert!(small.try_push(item("p-1")));
        assert!(small.try_push(item("p-1")));
        assert!(!small.try_push(item("p-1")));
        assert_eq!(small.len(), 2);
    }

    #[test]
    fn queue_is_idle_until_something_is_pushed() {
        let queue = TaskQueue::new();
        assert!(queue.is_idle());
        queue.push(QueueLane::Collect, item("p-1"));
        assert!(!queue.is_idle());
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn drain_all_empties_both_lanes() {
        let queue = TaskQueue::new();
        queue.push(QueueLane::Collect, item("p-1"));
        queue.push(QueueLane::Mutate, item("p-2"));
        assert_eq!(queue.depth(), 2);
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn push_beyond_capacity_is_dropped_not_panicked() {
        let queue = TaskQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            assert_eq!(queue.push(QueueLane::Mutate, item("p-1")), EnqueueOutcome::Accepted);
        }
        assert_eq!(queue.push(QueueLane::Mutate, item("p-1")), EnqueueOutcome::Dropped);
    }
}
