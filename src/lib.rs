//! # fleetvisor — multi-hypervisor instance orchestration control plane
//!
//! Facade crate that re-exports the fleetvisor workspace crates so a single
//! `fleetvisor` dependency pulls in the whole stack, and wires the
//! cross-crate collaborator (`fv-lifecycle`'s `PostCreateHooks`) that can't
//! be implemented inside any one crate without a dependency cycle.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | fv-core | Error taxonomy, domain model, config, naming, time |
//! | [`ssh`] | fv-ssh | Pooled SSH connections, SFTP upload |
//! | [`provider`] | fv-provider | `ProviderAdapter` trait and hypervisor adapters |
//! | [`reservation`] | fv-reservation | Quota accounting, VMID/IP/port allocation |
//! | [`lifecycle`] | fv-lifecycle | Instance state machine and task runner |
//! | [`network`] | fv-network | Post-create network configuration procedure |
//! | [`traffic`] | fv-traffic | `pmacct` install/collect/rollup/quota-enforce |
//! | [`registry`] | fv-registry | Provider handle registry, transport cleanup |
//! | [`queue`] | fv-queue | Bounded queues, adaptive batch processor |
//! | [`storage`] | fv-storage | The `Storage` trait plus memory/MySQL backends |

pub use fv_core as core;
pub use fv_lifecycle as lifecycle;
pub use fv_network as network;
pub use fv_provider as provider;
pub use fv_queue as queue;
pub use fv_registry as registry;
pub use fv_reservation as reservation;
pub use fv_ssh as ssh;
pub use fv_storage as storage;
pub use fv_traffic as traffic;

mod hooks;

pub use hooks::FleetHooks;
