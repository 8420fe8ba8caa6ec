//! Network configuration engine (spec §4.5, component C5): the procedure the
//! lifecycle engine drives after phase 2 of instance creation to take a
//! freshly-provisioned instance from "the adapter reported some address" to
//! "static IP bound, bandwidth capped, ports mapped, firewall opened, IPv6
//! wired up". Each step ships a small script over `fv_ssh::SshPool` rather
//! than running it locally; the adapter-call backoff loops use a hand-rolled
//! poll-with-growing-delay since `fv_core::retry::retry`'s closure is
//! synchronous and can't `.await` an adapter call.

pub mod bandwidth;
pub mod ipv6;
pub mod port_mapping;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fv_core::error::CoreError;
use fv_core::model::{Instance, InstanceType, PortMapping, PortMappingMethod, Provider};
use fv_provider::{NodeConfig, ProviderAdapter};
use fv_ssh::SshPool;
use fv_storage::Storage;
use tracing::{info, instrument, warn};

/// Per-instance-type timeouts and NIC discovery order (spec §4.5 steps 1, 2, 9).
struct Profile {
    nic_candidates: &'static [&'static str],
    ipv4_discovery_attempts: u32,
    ready_attempts: u32,
    ready_initial_delay: Duration,
    ready_max_delay: Duration,
}

fn profile_for(instance_type: InstanceType) -> Profile {
    match instance_type {
        InstanceType::Container => Profile {
            nic_candidates: &["eth0"],
            ipv4_discovery_attempts: 3,
            ready_attempts: 10,
            ready_initial_delay: Duration::from_secs(5),
            ready_max_delay: Duration::from_secs(5),
        },
        InstanceType::Vm => Profile {
            nic_candidates: &["enp5s0", "eth0"],
            ipv4_discovery_attempts: 8,
            ready_attempts: 8,
            ready_initial_delay: Duration::from_secs(15),
            ready_max_delay: Duration::from_secs(25),
        },
    }
}

/// Drives the stop/bind/start procedure over a provider's pooled SSH
/// connection; instance-lifecycle verbs (restart/start/stop/status) still go
/// through the [`ProviderAdapter`] so each hypervisor family can translate
/// them its own way.
pub struct NetworkConfigurator<S: Storage> {
    storage: Arc<S>,
    ssh: Arc<SshPool>,
}

impl<S: Storage> NetworkConfigurator<S> {
    pub fn new(storage: Arc<S>, ssh: Arc<SshPool>) -> Self {
        Self { storage, ssh }
    }

    /// Runs all eleven steps against an instance whose row already exists
    /// (phase 3 of create has already persisted it), updating its `private_ip`
    /// / `public_ipv6` fields as discovery proceeds.
    #[instrument(skip(self, adapter), fields(instance_id = %instance_id, provider_id = %provider.id))]
    pub async fn configure(
        &self,
        adapter: &dyn ProviderAdapter,
        provider: &Provider,
        node: &NodeConfig,
        instance_id: &str,
        internal_ip: &str,
    ) -> Result<(), CoreError> {
        let mut instance = self.storage.get_instance(instance_id).await?;
        let profile = profile_for(instance.instance_type);

        // Step 1: restart to force DHCP; fall back to a best-effort start.
        if adapter.restart_instance(&provider.id, instance_id).await.is_err() {
            warn!(instance_id, "network restart failed, falling back to start");
            adapter.start_instance(&provider.id, instance_id).await?;
        }

        // Step 2: discover IPv4 with growing backoff.
        let discovered_ip = discover_ipv4(adapter, &provider.id, instance_id, &profile).await?;

        // Step 3: discover the host IP (literal endpoint, else DNS A lookup).
        let host_ip = resolve_host_ip(&provider.endpoint)?;
        info!(host_ip, "resolved provider host address");

        // Step 4: stop and poll for STOPPED.
        adapter.stop_instance(&provider.id, instance_id).await?;
        wait_for_status(adapter, &provider.id, instance_id, "stopped", 6, Duration::from_secs(5)).await?;

        // Step 5: bandwidth cap on the primary NIC (falls back to eth0).
        let device = self.discover_device(node, profile.nic_candidates)?;
        let cap = bandwidth::effective_cap_mbps(instance.resources.bandwidth_mbps, provider);
        self.ssh.exec_stdout(&node.ssh, &bandwidth::shape_command(device.as_deref(), cap))?;

        // Step 6: bind the static internal IP to the NIC device.
        let dev = device.as_deref().unwrap_or("eth0");
        self.ssh
            .exec_stdout(&node.ssh, &format!("ip addr replace {internal_ip}/24 dev {dev}"))?;

        // Step 7: port mapping.
        let method = PortMappingMethod::effective_v4(provider.ipv4_port_mapping_method, provider.network_type);
        let active_ports = self.storage.list_active_ports(&provider.id).await?;
        for mapping in active_ports.iter().filter(|p| p.instance_id == instance_id) {
            self.apply_port_mapping(node, method, &instance.name, internal_ip, mapping)?;
        }

        // Step 8: start.
        adapter.start_instance(&provider.id, instance_id).await?;

        // Step 9: wait for readiness, growing the delay up to the profile's cap.
        wait_for_status_growing(adapter, &provider.id, instance_id, "running", &profile).await?;

        // Step 10: open firewall ports on the host.
        self.open_firewall(node, &instance)?;

        // Step 11: IPv6 subroutine, if this network type wants it.
        if provider.network_type.wants_ipv6() {
            self.configure_ipv6(node, &mut instance)?;
        }

        instance.private_ip = Some(discovered_ip);
        self.storage.upsert_instance(instance).await?;
        Ok(())
    }

    fn discover_device(&self, node: &NodeConfig, candidates: &[&str]) -> Result<Option<String>, CoreError> {
        for candidate in candidates {
            let out = self.ssh.exec(&node.ssh, &format!("ip link show {candidate}"))?;
            if out.success() {
                return Ok(Some((*candidate).to_string()));
            }
        }
        Ok(None)
    }

    fn apply_port_mapping(
        &self,
        node: &NodeConfig,
        method: PortMappingMethod,
        instance_name: &str,
        internal_ip: &str,
        mapping: &PortMapping,
    ) -> Result<(), CoreError> {
        for cmd in port_mapping::apply_commands(method, instance_name, internal_ip, mapping) {
            self.ssh.exec_stdout(&node.ssh, &cmd)?;
        }
        Ok(())
    }

    fn open_firewall(&self, node: &NodeConfig, instance: &Instance) -> Result<(), CoreError> {
        if let Some(port) = instance.ssh_port {
            self.ssh.exec_stdout(
                &node.ssh,
                &format!(
                    "iptables -C INPUT -p tcp --dport {port} -j ACCEPT 2>/dev/null || \
                     iptables -A INPUT -p tcp --dport {port} -j ACCEPT"
                ),
            )?;
        }
        Ok(())
    }

    fn configure_ipv6(&self, node: &NodeConfig, instance: &mut Instance) -> Result<(), CoreError> {
        let appended = self
            .ssh
            .exec_stdout(&node.ssh, "cat /etc/fleetvisor/ipv6_appended_addresses.txt 2>/dev/null || true")?;
        let used = HashSet::new();
        let Some(external) = ipv6::next_external_address(&appended, &used) else {
            warn!(instance_id = %instance.id, "ipv6 address pool exhausted");
            return Ok(());
        };
        let internal = instance.ipv6_address.clone().unwrap_or_default();
        if internal.is_empty() {
            return Ok(());
        }
        ipv6::apply(
            &self.ssh,
            &node.ssh,
            &[ipv6::Ipv6NatRule {
                external: external.clone(),
                internal,
            }],
        )?;
        instance.public_ipv6 = Some(external);
        Ok(())
    }
}

/// Step 2: poll `get_instance_ipv4`, treating `Ok(None)` (interface not up
/// yet) the same as a transient error, growing the delay by 50ms per attempt.
async fn discover_ipv4(
    adapter: &dyn ProviderAdapter,
    provider_id: &str,
    instance_id: &str,
    profile: &Profile,
) -> Result<String, CoreError> {
    let mut delay = Duration::from_millis(200);
    for attempt in 1..=profile.ipv4_discovery_attempts.max(3) {
        if let Some(ip) = adapter.get_instance_ipv4(provider_id, instance_id).await? {
            return Ok(ip);
        }
        if attempt < profile.ipv4_discovery_attempts {
            tokio::time::sleep(delay).await;
            delay += Duration::from_millis(150);
        }
    }
    Err(CoreError::Timeout {
        operation: "discover_ipv4".to_string(),
        elapsed_secs: 0,
    })
}

async fn wait_for_status(
    adapter: &dyn ProviderAdapter,
    provider_id: &str,
    instance_id: &str,
    want: &str,
    attempts: u32,
    delay: Duration,
) -> Result<(), CoreError> {
    for attempt in 1..=attempts {
        let remote = adapter.get_instance(provider_id, instance_id).await?;
        if remote.status.eq_ignore_ascii_case(want) {
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(CoreError::Timeout {
        operation: format!("wait_for_{want}"),
        elapsed_secs: attempts as u64 * delay.as_secs(),
    })
}

/// Step 9: same shape as [`wait_for_status`], but the delay itself grows each
/// attempt up to `profile.ready_max_delay` (spec: "growing to 25 s" for VMs).
async fn wait_for_status_growing(
    adapter: &dyn ProviderAdapter,
    provider_id: &str,
    instance_id: &str,
    want: &str,
    profile: &Profile,
) -> Result<(), CoreError> {
    let mut delay = profile.ready_initial_delay;
    for attempt in 1..=profile.ready_attempts {
        let remote = adapter.get_instance(provider_id, instance_id).await?;
        if remote.status.eq_ignore_ascii_case(want) {
            return Ok(());
        }
        if attempt < profile.ready_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(profile.ready_max_delay);
        }
    }
    Err(CoreError::Timeout {
        operation: format!("wait_for_{want}"),
        elapsed_secs: profile.ready_attempts as u64 * profile.ready_initial_delay.as_secs(),
    })
}

/// Host IP resolution order (spec §4.5 step 3): a literal dotted-quad
/// `endpoint` is used as-is; otherwise it's resolved as a DNS A record.
/// `provider.port_ip` from the conceptual spec has no counterpart on this
/// model's `Provider` row (see DESIGN.md), so the endpoint itself is the only
/// source tried before the host-side `ip addr` fallback the original
/// procedure describes.
fn resolve_host_ip(endpoint: &str) -> Result<String, CoreError> {
    if endpoint.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(endpoint.to_string());
    }
    use std::net::ToSocketAddrs;
    (endpoint, 0_u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip().to_string())
        .ok_or_else(|| CoreError::ValidationFailed {
            reason: format!("could not resolve provider endpoint {endpoint:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_host_ip_accepts_a_literal_address() {
        assert_eq!(resolve_host_ip("10.0.0.5").unwrap(), "10.0.0.5");
    }

    #[test]
    fn resolve_host_ip_rejects_unresolvable_names() {
        assert!(resolve_host_ip("this-host-does-not-exist.invalid").is_err());
    }

    #[test]
    fn container_profile_uses_eth0_only() {
        let p = profile_for(InstanceType::Container);
        assert_eq!(p.nic_candidates, &["eth0"]);
    }

    #[test]
    fn vm_profile_tries_enp5s0_before_eth0_and_grows_to_25s() {
        let p = profile_for(InstanceType::Vm);
        assert_eq!(p.nic_candidates, &["enp5s0", "eth0"]);
        assert_eq!(p.ready_max_delay, Duration::from_secs(25));
    }
}
