//! Provider handle registry & HTTP transport cleanup (spec §4.7, component
//! C7): the singleton table every other crate resolves a `provider_id` to a
//! live `Arc<dyn ProviderAdapter>` through, plus the sweeper that keeps the
//! registry's HTTP transports from leaking across reconnects.

pub mod health_probe;
pub mod registry;
pub mod transport_cleanup;

pub use registry::ProviderRegistry;
