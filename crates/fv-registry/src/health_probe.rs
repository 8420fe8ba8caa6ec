//! Background provider reachability probe (spec §11 "Provider health probe
//! loop"): every 60s, re-checks every loaded provider's health and flips
//! [`ProviderRegistry::is_reachable`] without touching instance status.
//! Grounded on `transport_cleanup::run`'s ticker/shutdown shape.

use std::sync::Arc;
use std::time::Duration;

use fv_storage::Storage;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::registry::ProviderRegistry;

const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Runs until `shutdown` resolves, probing every loaded provider every 60s.
pub async fn run<S: Storage>(registry: Arc<ProviderRegistry<S>>, shutdown: impl std::future::Future<Output = ()>) {
    let mut ticker = time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("running provider health probe");
                registry.probe_health().await;
            }
            _ = &mut shutdown => {
                debug!("health probe sweeper shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_provider::http_transport::TransportRegistry;
    use fv_ssh::SshPool;
    use fv_storage::memory::MemoryStorage;

    #[tokio::test]
    async fn run_stops_when_shutdown_resolves() {
        let storage = Arc::new(MemoryStorage::new());
        let ssh = Arc::new(SshPool::new(Default::default()));
        let transports = Arc::new(TransportRegistry::new());
        let registry = Arc::new(ProviderRegistry::new(storage, ssh, transports));
        let (tx, rx) = tokio::sync::oneshot::channel();
        tx.send(()).unwrap();
        let shutdown = async move {
            let _ = rx.await;
        };
        run(registry, shutdown).await;
    }
}
