//! [`PostCreateHooks`] wiring: the one piece of glue that has to live above
//! `fv-lifecycle`, `fv-network` and `fv-traffic` since none of the three may
//! depend on either of the others (spec §4.4, §4.6's "Installation" runs
//! once an instance first reaches `running`).

use std::sync::Arc;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::Instance;
use fv_lifecycle::{PostCreateHooks, ProviderDirectory};
use fv_network::NetworkConfigurator;
use fv_storage::Storage;
use fv_traffic::TrafficEngine;
use tracing::warn;

/// Runs network configuration then installs the traffic monitor on every
/// instance that reaches `running` for the first time; tears the monitor
/// down (by disabling it — `Storage` has no hard delete) on instance delete.
pub struct FleetHooks<S: Storage, D: ProviderDirectory> {
    storage: Arc<S>,
    directory: Arc<D>,
    network: Arc<NetworkConfigurator<S>>,
    traffic: Arc<TrafficEngine<S>>,
}

impl<S: Storage, D: ProviderDirectory> FleetHooks<S, D> {
    pub fn new(
        storage: Arc<S>,
        directory: Arc<D>,
        network: Arc<NetworkConfigurator<S>>,
        traffic: Arc<TrafficEngine<S>>,
    ) -> Self {
        Self { storage, directory, network, traffic }
    }
}

#[async_trait]
impl<S: Storage, D: ProviderDirectory> PostCreateHooks for FleetHooks<S, D> {
    async fn on_instance_running(&self, instance: &Instance) -> Result<(), CoreError> {
        let provider = self.storage.get_provider(&instance.provider_id).await?;
        let adapter = self.directory.adapter(&instance.provider_id).await?;
        let node = self.directory.node_config(&instance.provider_id).await?;
        let internal_ip = instance.private_ip.clone().unwrap_or_default();

        // Network/port/firewall steps are non-fatal to create (spec §7
        // propagation policy): the instance still reaches `running`, just
        // with reduced functionality, so this warns instead of propagating.
        if let Err(err) =
            self.network.configure(adapter.as_ref(), &provider, &node, &instance.id, &internal_ip).await
        {
            warn!(instance_id = %instance.id, error = %err, "post-create network configuration failed");
        }

        let device = instance.pmacct_interface_v4.clone().unwrap_or_else(|| "eth0".to_string());
        self.traffic.install(&node, instance, &device).await
    }

    async fn on_instance_deleted(&self, instance_id: &str, _provider_id: &str) -> Result<(), CoreError> {
        if let Some(mut monitor) = self.storage.get_pmacct_monitor(instance_id).await? {
            monitor.is_enabled = false;
            self.traffic.disable_monitor(monitor).await?;
        }
        Ok(())
    }
}
