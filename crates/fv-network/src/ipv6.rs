//! IPv6 subroutine (spec §4.5 step 11): allocate an external address from an
//! appended-addresses file, maintain the NAT6 rule script, restart the
//! `ipv6nat` service. Writes one script and ships it via `fv_ssh::upload_file`
//! rather than building up the rule set command-by-command.

use std::collections::HashSet;

use fv_core::error::CoreError;
use fv_ssh::{ConnectParams, SshPool};

pub const NAT_RULES_SCRIPT_PATH: &str = "/usr/local/bin/ipv6_nat_rules.sh";

/// One instance's external-to-internal IPv6 1:1 NAT mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6NatRule {
    pub external: String,
    pub internal: String,
}

/// First address in `appended_addresses` (one per line, blanks and `#`
/// comments ignored) that isn't already claimed by another instance.
pub fn next_external_address(appended_addresses: &str, used: &HashSet<String>) -> Option<String> {
    appended_addresses
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .find(|addr| !used.contains(*addr))
        .map(str::to_string)
}

/// Renders the full `ip6tables` NAT6 script for every active rule, in the
/// teacher's idempotent `-C ... || -A ...` style.
pub fn render_nat_rules_script(rules: &[Ipv6NatRule]) -> String {
    let mut script = String::from("#!/bin/bash\nset -e\n");
    for rule in rules {
        script.push_str(&format!(
            "ip6tables -t nat -C PREROUTING -d {ext} -j DNAT --to-destination {int} 2>/dev/null || \\\n  \
             ip6tables -t nat -A PREROUTING -d {ext} -j DNAT --to-destination {int}\n\
             ip6tables -t nat -C POSTROUTING -s {int} -j SNAT --to-source {ext} 2>/dev/null || \\\n  \
             ip6tables -t nat -A POSTROUTING -s {int} -j SNAT --to-source {ext}\n",
            ext = rule.external,
            int = rule.internal,
        ));
    }
    script
}

/// Writes the rendered script and restarts the `ipv6nat` unit so it's picked
/// up (spec §4.5 step 11).
pub fn apply(ssh: &SshPool, params: &ConnectParams, rules: &[Ipv6NatRule]) -> Result<(), CoreError> {
    let script = render_nat_rules_script(rules);
    fv_ssh::upload_file(ssh, params, NAT_RULES_SCRIPT_PATH, script.as_bytes(), 0o755)?;
    ssh.exec_stdout(params, &format!("bash {NAT_RULES_SCRIPT_PATH}"))?;
    ssh.exec_stdout(params, "systemctl restart ipv6nat || service ipv6nat restart")?;
    Ok(())
}
