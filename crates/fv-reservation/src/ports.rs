//! Port range allocation under a provider-scoped critical section (spec
//! §4.3): the SSH port is allocated first and marked `is_ssh=true`, then any
//! explicitly requested extras. Rows are inserted `pending` before the
//! hypervisor call and flipped to `active` on success.

use std::collections::HashMap;
use std::sync::Arc;

use fv_core::error::CoreError;
use fv_core::model::{PortMapping, PortProtocol, PortStatus};
use fv_storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

pub struct PortAllocator<S: Storage> {
    storage: Arc<S>,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// One port the caller wants mapped, beyond the implicit SSH port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestedPort {
    pub guest_port: u16,
    pub protocol: PortProtocol,
}

impl<S: Storage> PortAllocator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn provider_lock(&self, provider_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .expect("port allocator lock table poisoned")
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn first_free(
        taken: &[PortMapping],
        range_start: u16,
        range_end: u16,
        protocol: PortProtocol,
    ) -> Option<u16> {
        (range_start..=range_end).find(|candidate| {
            !taken
                .iter()
                .any(|p| p.host_port == *candidate && p.protocol.conflicts_with(protocol))
        })
    }

    /// Allocates the SSH port plus any requested extras for one instance,
    /// inserting all rows in `pending` status. Returns the allocated mappings
    /// in the order: SSH port first, then extras in request order.
    pub async fn allocate(
        &self,
        provider_id: &str,
        instance_id: &str,
        guest_ssh_port: u16,
        range_start: u16,
        range_end: u16,
        extras: &[RequestedPort],
    ) -> Result<Vec<PortMapping>, CoreError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.lock().await;

        let mut taken = self.storage.list_active_ports(provider_id).await?;
        let mut allocated = Vec::with_capacity(1 + extras.len());

        let ssh_host_port = Self::first_free(&taken, range_start, range_end, PortProtocol::Tcp).ok_or_else(|| {
            CoreError::CapacityExhausted {
                dimension: "ports".to_string(),
            }
        })?;
        let ssh_mapping = PortMapping {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            provider_id: provider_id.to_string(),
            host_port: ssh_host_port,
            guest_port: guest_ssh_port,
            protocol: PortProtocol::Tcp,
            is_ssh: true,
            description: Some("ssh".to_string()),
            status: PortStatus::Pending,
        };
        self.storage.insert_port(ssh_mapping.clone()).await?;
        taken.push(ssh_mapping.clone());
        allocated.push(ssh_mapping);

        for extra in extras {
            let host_port = Self::first_free(&taken, range_start, range_end, extra.protocol).ok_or_else(|| {
                CoreError::CapacityExhausted {
                    dimension: "ports".to_string(),
                }
            })?;
            let mapping = PortMapping {
                id: uuid::Uuid::new_v4().to_string(),
                instance_id: instance_id.to_string(),
                provider_id: provider_id.to_string(),
                host_port,
                guest_port: extra.guest_port,
                protocol: extra.protocol,
                is_ssh: false,
                description: None,
                status: PortStatus::Pending,
            };
            self.storage.insert_port(mapping.clone()).await?;
            taken.push(mapping.clone());
            allocated.push(mapping);
        }

        Ok(allocated)
    }

    /// Flips every mapping for this instance from `pending` to `active` after
    /// a successful hypervisor call.
    pub async fn activate_all(&self, mappings: &[PortMapping]) -> Result<(), CoreError> {
        for mapping in mappings {
            self.storage.activate_port(&mapping.id).await?;
        }
        Ok(())
    }

    /// Deletes every pending mapping for a failed create (spec §4.4 phase 3).
    pub async fn release_all(&self, mappings: &[PortMapping]) -> Result<(), CoreError> {
        for mapping in mappings {
            self.storage.release_port(&mapping.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_storage::memory::MemoryStorage;

    #[tokio::test]
    async fn allocates_ssh_port_first_then_extras_without_collision() {
        let storage = Arc::new(MemoryStorage::new());
        let allocator = PortAllocator::new(storage.clone());
        let extras = vec![RequestedPort {
            guest_port: 80,
            protocol: PortProtocol::Tcp,
        }];
        let mappings = allocator.allocate("p1", "i1", 22, 10000, 10010, &extras).await.unwrap();
        assert_eq!(mappings.len(), 2);
        assert!(mappings[0].is_ssh);
        assert_ne!(mappings[0].host_port, mappings[1].host_port);
        assert!(mappings.iter().all(|m| m.status == PortStatus::Pending));

        allocator.activate_all(&mappings).await.unwrap();
        let active = storage.list_active_ports("p1").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_range_returns_capacity_exhausted() {
        let storage = Arc::new(MemoryStorage::new());
        let allocator = PortAllocator::new(storage);
        // range of exactly one port, consumed by the ssh allocation
        let err = allocator
            .allocate(
                "p1",
                "i1",
                22,
                10000,
                10000,
                &[RequestedPort {
                    guest_port: 80,
                    protocol: PortProtocol::Tcp,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted { .. }));
    }
}
