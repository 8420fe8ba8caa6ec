//! Egress/ingress shaping (spec §4.5 step 5). Builds one multi-line shell
//! script and ships it to the provider host in a single SSH round trip.

use fv_core::model::Provider;

/// `min(instance's already-capped bandwidth, provider.default, provider.max)`
/// (spec §4.5 step 5). The instance's `resources.bandwidth_mbps` already
/// passed the user-level quota cap at reservation time, so the provider's two
/// bandwidth fields are the only additional ceiling applied here.
pub fn effective_cap_mbps(instance_bandwidth_mbps: u32, provider: &Provider) -> u32 {
    instance_bandwidth_mbps
        .min(provider.default_bandwidth_mbps)
        .min(provider.max_bandwidth_mbps)
}

/// Builds the `tc` invocation that shapes `device` to `cap_mbps` in both
/// directions, falling back to `eth0` if `device` couldn't be discovered.
pub fn shape_command(device: Option<&str>, cap_mbps: u32) -> String {
    let dev = device.unwrap_or("eth0");
    format!(
        "tc qdisc replace dev {dev} root tbf rate {cap_mbps}mbit burst 32kbit latency 400ms && \
         tc qdisc replace dev {dev} ingress && \
         tc filter replace dev {dev} parent ffff: protocol ip u32 match u32 0 0 police rate {cap_mbps}mbit burst 32kbit drop"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_core::model::{ExecutionRule, NetworkType, PortMappingMethod, ProviderCredentials, ProviderType, ResourceAmounts};

    fn provider(default_bw: u32, max_bw: u32) -> Provider {
        Provider {
            id: "p1".into(),
            name: "host".into(),
            provider_type: ProviderType::Lxd,
            endpoint: "10.0.0.1".into(),
            port: 8443,
            credentials: ProviderCredentials {
                password: None,
                private_key: None,
                api_token: None,
                tls_cert: None,
            },
            network_type: NetworkType::NatIpv4,
            ipv4_port_mapping_method: PortMappingMethod::DeviceProxy,
            ipv6_port_mapping_method: PortMappingMethod::None,
            total_quota: ResourceAmounts::default(),
            max_container_instances: 100,
            max_vm_instances: 0,
            container_count: 0,
            vm_count: 0,
            count_cache_expires_at: None,
            default_bandwidth_mbps: default_bw,
            max_bandwidth_mbps: max_bw,
            port_range_start: 10000,
            port_range_end: 10100,
            storage_pool: "default".into(),
            execution_rule: ExecutionRule::Auto,
            allow_claim: true,
            is_frozen: false,
            traffic_limited: false,
            enable_traffic_control: false,
            used_traffic_bytes: 0,
            traffic_limit_bytes: None,
            expiry: None,
        }
    }

    #[test]
    fn cap_is_the_tightest_of_the_three() {
        assert_eq!(effective_cap_mbps(500, &provider(200, 1000)), 200);
        assert_eq!(effective_cap_mbps(50, &provider(200, 1000)), 50);
        assert_eq!(effective_cap_mbps(500, &provider(1000, 100)), 100);
    }

    #[test]
    fn shape_command_falls_back_to_eth0() {
        let cmd = shape_command(None, 100);
        assert!(cmd.contains("dev eth0"));
        assert!(cmd.contains("100mbit"));
    }

    #[test]
    fn shape_command_uses_discovered_device() {
        let cmd = shape_command(Some("enp5s0"), 250);
        assert!(cmd.contains("dev enp5s0"));
    }
}
