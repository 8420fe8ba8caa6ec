//! Level-limit resolution and the reserve/consume/release transaction shape
//! (spec §4.3): a small struct wrapping a storage handle plus two
//! level-limit tables, re-checked against `used + pending + requested`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use fv_core::error::CoreError;
use fv_core::model::{InstanceType, LevelLimits, Reservation, ResourceAmounts, effective_level_cap};
use fv_storage::Storage;

/// Global and per-provider level overlays (spec §3 `Level limits`), keyed by
/// user level. Loaded once at daemon start from config/DB and handed to the
/// engine; re-resolved per provider on every reserve call.
#[derive(Debug, Clone, Default)]
pub struct LevelLimitsTable {
    pub global: HashMap<u32, LevelLimits>,
    pub per_provider: HashMap<(String, u32), LevelLimits>,
}

impl LevelLimitsTable {
    fn global_for(&self, level: u32) -> LevelLimits {
        self.global.get(&level).cloned().unwrap_or(LevelLimits {
            max_instances: 0,
            max_resources: ResourceAmounts::default(),
            max_traffic_bytes: 0,
        })
    }

    fn provider_for(&self, provider_id: &str, level: u32) -> LevelLimits {
        self.per_provider
            .get(&(provider_id.to_string(), level))
            .cloned()
            .unwrap_or(LevelLimits {
                max_instances: u32::MAX,
                max_resources: ResourceAmounts {
                    cpu: u32::MAX,
                    memory_mb: u64::MAX,
                    disk_mb: u64::MAX,
                    bandwidth_mbps: u32::MAX,
                },
                max_traffic_bytes: u64::MAX,
            })
    }

    /// `min(global[level], provider[level])` per dimension (spec §3).
    pub fn effective(&self, provider_id: &str, level: u32) -> LevelLimits {
        effective_level_cap(&self.global_for(level), &self.provider_for(provider_id, level))
    }
}

pub struct QuotaEngine<S: Storage> {
    storage: Arc<S>,
    levels: LevelLimitsTable,
    reservation_ttl: ChronoDuration,
}

impl<S: Storage> QuotaEngine<S> {
    pub fn new(storage: Arc<S>, levels: LevelLimitsTable, reservation_ttl: std::time::Duration) -> Self {
        Self {
            storage,
            levels,
            reservation_ttl: ChronoDuration::from_std(reservation_ttl).unwrap_or(ChronoDuration::hours(1)),
        }
    }

    /// `ReserveResources(user, provider, session_id, spec)` (spec §4.3): lock
    /// the user quota row, verify `used + pending + requested <= min(global,
    /// provider)`, write a reservation with `expires_at = now + ttl`, add to
    /// `pending_*`.
    pub async fn reserve(
        &self,
        user_id: &str,
        provider_id: &str,
        session_id: &str,
        instance_type: InstanceType,
        requested: ResourceAmounts,
    ) -> Result<Reservation, CoreError> {
        let quota = self.storage.get_user_quota(user_id).await?;
        let effective = self.levels.effective(provider_id, quota.level);
        let expires_at = Utc::now() + self.reservation_ttl;
        self.storage
            .reserve_resources(
                user_id,
                provider_id,
                session_id,
                instance_type,
                requested,
                &effective.max_resources,
                effective.max_instances,
                expires_at,
            )
            .await
    }

    /// `ConsumeReservationBySession` (spec §4.3): idempotent, moves
    /// `pending_*` to `used_*`.
    pub async fn consume(&self, session_id: &str) -> Result<(), CoreError> {
        self.storage.consume_reservation(session_id).await
    }

    /// Background sweeper (spec §4.3: "every ~10 minutes"): releases expired,
    /// unconsumed reservations. Returns the count released.
    pub async fn sweep_expired(&self) -> Result<u64, CoreError> {
        self.storage.release_expired_reservations(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_storage::memory::MemoryStorage;

    fn table_with_room() -> LevelLimitsTable {
        let mut global = HashMap::new();
        global.insert(
            0,
            LevelLimits {
                max_instances: 5,
                max_resources: ResourceAmounts {
                    cpu: 16,
                    memory_mb: 16_384,
                    disk_mb: 200_000,
                    bandwidth_mbps: 1000,
                },
                max_traffic_bytes: 1_000_000_000,
            },
        );
        LevelLimitsTable {
            global,
            per_provider: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reserve_then_consume_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user_quota(fv_core::model::UserQuota {
            user_id: "u1".to_string(),
            level: 0,
            ..Default::default()
        });
        let engine = QuotaEngine::new(storage.clone(), table_with_room(), std::time::Duration::from_secs(3600));

        let requested = ResourceAmounts {
            cpu: 2,
            memory_mb: 2048,
            disk_mb: 20_000,
            bandwidth_mbps: 100,
        };
        let reservation = engine
            .reserve("u1", "p1", "sess-1", InstanceType::Container, requested)
            .await
            .unwrap();
        assert_eq!(reservation.session_id, "sess-1");

        engine.consume("sess-1").await.unwrap();
        let quota = storage.get_user_quota("u1").await.unwrap();
        assert_eq!(quota.used.cpu, 2);
        assert_eq!(quota.pending.cpu, 0);
    }

    #[tokio::test]
    async fn reserve_over_cap_fails_capacity_exhausted() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user_quota(fv_core::model::UserQuota {
            user_id: "u1".to_string(),
            level: 0,
            ..Default::default()
        });
        let engine = QuotaEngine::new(storage, table_with_room(), std::time::Duration::from_secs(3600));

        let huge = ResourceAmounts {
            cpu: 100,
            memory_mb: 1,
            disk_mb: 1,
            bandwidth_mbps: 1,
        };
        let err = engine
            .reserve("u1", "p1", "sess-huge", InstanceType::Container, huge)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted { .. }));
    }
}
