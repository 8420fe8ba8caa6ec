//! Background HTTP transport idle-sweeper (spec §4.7: "a background sweeper
//! (10-minute cadence) drops transports whose `last_access > 30 min`").
//! `fv_provider::http_transport::TransportRegistry::sweep_idle` already does
//! the pruning; this just drives it on a ticker against a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use fv_provider::http_transport::{TransportConfig, TransportRegistry};
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const IDLE_EVICT_AFTER: Duration = Duration::from_secs(30 * 60);

/// Runs until `shutdown` resolves, sweeping `transports` every 10 minutes.
pub async fn run(transports: Arc<TransportRegistry>, shutdown: impl std::future::Future<Output = ()>) {
    let config = TransportConfig { idle_evict_after: IDLE_EVICT_AFTER, accept_invalid_certs: false };
    let mut ticker = time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("running http transport idle sweep");
                transports.sweep_idle(&config);
            }
            _ = &mut shutdown => {
                debug!("transport cleanup sweeper shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_stops_when_shutdown_resolves() {
        let transports = Arc::new(TransportRegistry::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        tx.send(()).unwrap();
        let shutdown = async move {
            let _ = rx.await;
        };
        run(transports, shutdown).await;
    }
}
