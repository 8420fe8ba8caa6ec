//! Port mapping dispatch (spec §4.5 step 7). Each method applies the same
//! `iptables -C ... || iptables -A ...` idempotency idiom before inserting
//! a rule, so re-running a mapping never duplicates it.

use fv_core::model::{PortMapping, PortProtocol};

fn protocol_str(p: PortProtocol) -> &'static str {
    match p {
        PortProtocol::Tcp => "tcp",
        PortProtocol::Udp => "udp",
        // iptables has no single "both" match; callers expand `Both` into one
        // rule per concrete protocol before reaching this module.
        PortProtocol::Both => "tcp",
    }
}

/// `lxc config device add <instance> proxy-<guest_port> proxy listen=<proto>:0.0.0.0:<host_port> connect=<proto>:127.0.0.1:<guest_port>`
/// (device_proxy method, LXD/Incus). Run while the instance is stopped.
pub fn device_proxy_add_command(instance_name: &str, mapping: &PortMapping) -> String {
    let proto = protocol_str(mapping.protocol);
    format!(
        "lxc config device add {instance_name} proxy-{guest} proxy \
         listen={proto}:0.0.0.0:{host} connect={proto}:127.0.0.1:{guest}",
        guest = mapping.guest_port,
        host = mapping.host_port,
    )
}

/// DNAT on `PREROUTING` to `internal_ip:guest_port`, persisted to
/// `/etc/iptables/rules.v4` (iptables method).
pub fn iptables_dnat_commands(internal_ip: &str, mapping: &PortMapping) -> Vec<String> {
    let proto = protocol_str(mapping.protocol);
    let check = format!(
        "iptables -t nat -C PREROUTING -p {proto} --dport {host} -j DNAT --to-destination {internal_ip}:{guest}",
        host = mapping.host_port,
        guest = mapping.guest_port,
    );
    let add = check.replacen("-C", "-A", 1);
    vec![
        format!("{check} 2>/dev/null || {add}"),
        "iptables-save > /etc/iptables/rules.v4".to_string(),
    ]
}

/// Every command needed to apply one [`PortMapping`] under the given
/// effective v4 method. `native` and `None` need no host-side rule — the
/// instance owns the address directly, or v4 is disabled entirely.
pub fn apply_commands(
    method: fv_core::model::PortMappingMethod,
    instance_name: &str,
    internal_ip: &str,
    mapping: &PortMapping,
) -> Vec<String> {
    use fv_core::model::PortMappingMethod::*;
    match method {
        DeviceProxy => vec![device_proxy_add_command(instance_name, mapping)],
        Iptables => iptables_dnat_commands(internal_ip, mapping),
        Native | None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_core::model::PortStatus;

    fn mapping(protocol: PortProtocol) -> PortMapping {
        PortMapping {
            id: "port1".into(),
            instance_id: "i1".into(),
            provider_id: "p1".into(),
            host_port: 10022,
            guest_port: 22,
            protocol,
            is_ssh: true,
            description: Some("ssh".into()),
            status: PortStatus::Pending,
        }
    }

    #[test]
    fn device_proxy_names_the_device_after_the_guest_port() {
        let cmd = device_proxy_add_command("box1", &mapping(PortProtocol::Tcp));
        assert!(cmd.contains("proxy-22"));
        assert!(cmd.contains("listen=tcp:0.0.0.0:10022"));
        assert!(cmd.contains("connect=tcp:127.0.0.1:22"));
    }

    #[test]
    fn iptables_dnat_checks_before_adding_and_persists() {
        let cmds = iptables_dnat_commands("172.16.1.5", &mapping(PortProtocol::Tcp));
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("-C PREROUTING"));
        assert!(cmds[0].contains("-A PREROUTING"));
        assert!(cmds[0].contains("172.16.1.5:22"));
        assert_eq!(cmds[1], "iptables-save > /etc/iptables/rules.v4");
    }

    #[test]
    fn native_and_none_need_no_rules() {
        let m = mapping(PortProtocol::Tcp);
        assert!(apply_commands(fv_core::model::PortMappingMethod::Native, "box1", "172.16.1.5", &m).is_empty());
        assert!(apply_commands(fv_core::model::PortMappingMethod::None, "box1", "172.16.1.5", &m).is_empty());
    }

    #[test]
    fn dispatch_picks_the_right_builder() {
        let m = mapping(PortProtocol::Udp);
        let cmds = apply_commands(fv_core::model::PortMappingMethod::DeviceProxy, "box1", "172.16.1.5", &m);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("lxc config device add"));
    }
}
