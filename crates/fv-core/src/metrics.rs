use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A single named counter/gauge. Counters only go up via `incr`; gauges are set
/// directly via `set`. Readable without locking via `get`.
#[derive(Debug, Default)]
pub struct Metric(AtomicI64);

impl Metric {
    pub fn incr(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Minimal in-process metrics registry (spec §10.5 of SPEC_FULL.md): no external
/// exporter, readable by the `fv status` CLI surface.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<HashMap<&'static str, Arc<Metric>>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(&self, name: &'static str) -> Arc<Metric> {
        let mut guard = self.inner.lock().expect("metrics mutex poisoned");
        guard.entry(name).or_default().clone()
    }

    pub fn snapshot(&self) -> HashMap<&'static str, i64> {
        let guard = self.inner.lock().expect("metrics mutex poisoned");
        guard.iter().map(|(k, v)| (*k, v.get())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_incr_and_set() {
        let m = Metrics::new();
        let active_ssh = m.metric("ssh_active_connections");
        active_ssh.incr(1);
        active_ssh.incr(1);
        assert_eq!(active_ssh.get(), 2);
        active_ssh.set(0);
        assert_eq!(active_ssh.get(), 0);
    }

    #[test]
    fn snapshot_reflects_all_named_metrics() {
        let m = Metrics::new();
        m.metric("queue_depth").set(7);
        m.metric("reservation_pending_cpu").set(3);
        let snap = m.snapshot();
        assert_eq!(snap.get("queue_depth"), Some(&7));
        assert_eq!(snap.get("reservation_pending_cpu"), Some(&3));
    }
}
