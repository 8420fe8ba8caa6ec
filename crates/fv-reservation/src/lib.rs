//! Resource accounting & reservation engine (spec §4.3, component C3): quota
//! rows and the locked reserve/consume/release transaction, Proxmox
//! VMID/internal-IP allocation, and port range allocation.

pub mod ports;
pub mod quota;
pub mod vmid;

pub use ports::{PortAllocator, RequestedPort};
pub use quota::{LevelLimitsTable, QuotaEngine};
pub use vmid::VmidAllocator;
