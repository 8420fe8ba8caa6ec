//! Instance state machine, task runner and the create/start/stop/restart/
//! reset/delete/reset-password flows (spec §4.4, §6, component C4).
//!
//! `fv-registry` (provider handle lookup) and `fv-network`/`fv-traffic`
//! (post-create hooks) are later in the build order than this crate, so
//! rather than depend forward on them this crate defines the narrow traits it
//! needs at its own boundary and takes implementations of them as generic
//! parameters — the same shape the design notes describe for the
//! lifecycle-engine/task-service split ("cyclic references... broken by an
//! interface; the dependent is registered at startup").

pub mod actions;
pub mod create;
pub mod password;
pub mod state;
pub mod task;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_provider::{NodeConfig, ProviderAdapter};
use fv_reservation::{PortAllocator, QuotaEngine, VmidAllocator};
use fv_storage::Storage;

pub use task::{TaskRunner, submit_task};

/// Resolves a connected provider adapter and its connection parameters by id.
/// Implemented by `fv-registry`'s provider table; a fake is supplied in this
/// crate's own tests.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn adapter(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, CoreError>;
    async fn node_config(&self, provider_id: &str) -> Result<NodeConfig, CoreError>;
}

/// Work run after an instance transitions to `running` for the first time
/// (network port/bandwidth setup, pmacct monitor registration) — implemented
/// once `fv-network`/`fv-traffic` exist. A no-op implementation is fine until
/// then; nothing in this crate requires it to do anything.
#[async_trait]
pub trait PostCreateHooks: Send + Sync {
    async fn on_instance_running(&self, instance: &fv_core::model::Instance) -> Result<(), CoreError>;
    async fn on_instance_deleted(&self, instance_id: &str, provider_id: &str) -> Result<(), CoreError>;
}

/// No-op [`PostCreateHooks`] for callers that haven't wired up networking yet.
pub struct NoopPostCreateHooks;

#[async_trait]
impl PostCreateHooks for NoopPostCreateHooks {
    async fn on_instance_running(&self, _instance: &fv_core::model::Instance) -> Result<(), CoreError> {
        Ok(())
    }

    async fn on_instance_deleted(&self, _instance_id: &str, _provider_id: &str) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Shared collaborators every lifecycle operation needs, bundled so
/// `create`/`actions`/`password` don't each take five separate arguments.
pub struct Engine<S: Storage, D: ProviderDirectory, H: PostCreateHooks> {
    pub storage: Arc<S>,
    pub directory: Arc<D>,
    pub hooks: Arc<H>,
    pub quota: Arc<QuotaEngine<S>>,
    pub vmid: Arc<VmidAllocator>,
    pub ports: Arc<PortAllocator<S>>,
}

impl<S: Storage, D: ProviderDirectory, H: PostCreateHooks> Engine<S, D, H> {
    pub fn new(
        storage: Arc<S>,
        directory: Arc<D>,
        hooks: Arc<H>,
        quota: Arc<QuotaEngine<S>>,
        vmid: Arc<VmidAllocator>,
        ports: Arc<PortAllocator<S>>,
    ) -> Self {
        Self {
            storage,
            directory,
            hooks,
            quota,
            vmid,
            ports,
        }
    }
}
