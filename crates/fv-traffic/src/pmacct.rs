//! Per-instance `pmacct` monitor installation (spec §4.6 "Installation").
//! Platform detection is an enum-plus-probe over a remote `ssh.exec_stdout`
//! call rather than a local `cfg!`/`Path::new` check; the config file itself
//! is rendered with `tera`.

use fv_core::error::CoreError;
use fv_core::model::Instance;
use fv_ssh::{ConnectParams, SshPool};
use tera::{Context, Tera};

/// Remote init system, detected in the order spec §4.6 step 1 lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    OpenRc,
    SysVInit,
    Nohup,
}

impl InitSystem {
    pub fn detect(ssh: &SshPool, params: &ConnectParams) -> Result<Self, CoreError> {
        if ssh.exec(params, "test -d /run/systemd/system")?.success() {
            return Ok(InitSystem::Systemd);
        }
        if ssh.exec(params, "command -v rc-service")?.success() {
            return Ok(InitSystem::OpenRc);
        }
        if ssh.exec(params, "test -d /etc/init.d && command -v service")?.success() {
            return Ok(InitSystem::SysVInit);
        }
        Ok(InitSystem::Nohup)
    }

    /// Unit name + file content for this init system, or `None` for `Nohup`
    /// (spec: "else `nohup`" has no persistent unit, just a backgrounded process).
    fn unit_file(self, instance_name: &str, conf_dir: &str) -> Option<(String, String)> {
        let unit_name = format!("pmacctd-{instance_name}");
        match self {
            InitSystem::Systemd => Some((
                format!("/etc/systemd/system/{unit_name}.service"),
                format!(
                    "[Unit]\nDescription=pmacct traffic monitor for {instance_name}\nAfter=network.target\n\n\
                     [Service]\nExecStart=/usr/sbin/pmacctd -f {conf_dir}/pmacctd.conf\n\
                     PIDFile={conf_dir}/pmacctd.pid\nRestart=on-failure\n\n\
                     [Install]\nWantedBy=multi-user.target\n"
                ),
            )),
            InitSystem::OpenRc => Some((
                format!("/etc/init.d/{unit_name}"),
                format!(
                    "#!/sbin/openrc-run\ncommand=/usr/sbin/pmacctd\ncommand_args=\"-f {conf_dir}/pmacctd.conf\"\n\
                     pidfile={conf_dir}/pmacctd.pid\ncommand_background=true\n"
                ),
            )),
            InitSystem::SysVInit => Some((
                format!("/etc/init.d/{unit_name}"),
                format!(
                    "#!/bin/sh\n### BEGIN INIT INFO\n# Provides: {unit_name}\n### END INIT INFO\n\
                     /usr/sbin/pmacctd -f {conf_dir}/pmacctd.conf -D -w {conf_dir}/pmacctd.pid\n"
                ),
            )),
            InitSystem::Nohup => None,
        }
    }

    /// Command that starts the monitor once its unit (if any) is installed.
    fn start_command(self, instance_name: &str, conf_dir: &str) -> String {
        let unit_name = format!("pmacctd-{instance_name}");
        match self {
            InitSystem::Systemd => format!("systemctl enable --now {unit_name}"),
            InitSystem::OpenRc => format!("rc-update add {unit_name} default && rc-service {unit_name} start"),
            InitSystem::SysVInit => format!("chmod +x /etc/init.d/{unit_name} && service {unit_name} start"),
            InitSystem::Nohup => format!(
                "nohup /usr/sbin/pmacctd -f {conf_dir}/pmacctd.conf > {conf_dir}/pmacctd.log 2>&1 & echo $! > {conf_dir}/pmacctd.pid"
            ),
        }
    }
}

/// Host distro family, detected from `/etc/*-release` (spec §4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    DebianLike,
    RhelLike,
    Alpine,
    Arch,
}

impl Distro {
    pub fn detect(ssh: &SshPool, params: &ConnectParams) -> Result<Self, CoreError> {
        let release = ssh.exec_stdout(params, "cat /etc/*-release 2>/dev/null")?.to_lowercase();
        if release.contains("alpine") {
            Ok(Distro::Alpine)
        } else if release.contains("arch") {
            Ok(Distro::Arch)
        } else if release.contains("rhel")
            || release.contains("centos")
            || release.contains("almalinux")
            || release.contains("rocky")
            || release.contains("ol_")
            || release.contains("oracle")
        {
            Ok(Distro::RhelLike)
        } else {
            Ok(Distro::DebianLike)
        }
    }

    /// Install command for `pmacct` + `sqlite3`, preferring `dnf` over `yum`
    /// on the RHEL family per spec §4.6 step 2.
    pub fn install_command(self, dnf_available: bool) -> &'static str {
        match self {
            Distro::DebianLike => "apt-get update -qq && apt-get install -y -qq pmacct sqlite3",
            Distro::RhelLike if dnf_available => "dnf install -y pmacct sqlite",
            Distro::RhelLike => "yum install -y pmacct sqlite",
            Distro::Alpine => "apk add --no-cache pmacct sqlite",
            Distro::Arch => "pacman -Sy --noconfirm pmacct sqlite",
        }
    }

}

fn already_installed_check() -> &'static str {
    "command -v pmacctd >/dev/null 2>&1 && command -v sqlite3 >/dev/null 2>&1"
}

/// `sql_cache_entries`/`plugin_buffer_size`/`plugin_pipe_size`, scaled by the
/// instance's configured bandwidth (spec §4.6: "50 Mbps → 32 entries, 1 Gbps →
/// 512, >2 Gbps → 1024").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizing {
    pub sql_cache_entries: u32,
    pub plugin_buffer_size: u32,
    pub plugin_pipe_size: u32,
}

pub fn buffer_sizing(bandwidth_mbps: u32) -> BufferSizing {
    let entries = if bandwidth_mbps <= 50 {
        32
    } else if bandwidth_mbps <= 1000 {
        512
    } else {
        1024
    };
    BufferSizing {
        sql_cache_entries: entries,
        plugin_buffer_size: entries * 1024,
        plugin_pipe_size: entries * 1024 * 10,
    }
}

/// Non-internal-traffic BPF filter (spec §4.6: excludes RFC1918, loopback,
/// link-local, multicast, broadcast; matches the instance's monitored
/// addresses).
pub fn bpf_filter(private_ip: Option<&str>, public_ipv6: Option<&str>) -> String {
    let exclusions = "not (net 10.0.0.0/8 or net 172.16.0.0/12 or net 192.168.0.0/16 \
                       or net 127.0.0.0/8 or net 169.254.0.0/16 or multicast or broadcast)";
    let mut hosts = Vec::new();
    if let Some(ip) = private_ip {
        hosts.push(format!("host {ip}"));
    }
    if let Some(ip6) = public_ipv6 {
        hosts.push(format!("host {ip6}"));
    }
    if hosts.is_empty() {
        exclusions.to_string()
    } else {
        format!("{exclusions} and ({})", hosts.join(" or "))
    }
}

const PMACCTD_CONF_TEMPLATE: &str = r#"daemonize: true
pidfile: {{ conf_dir }}/pmacctd.pid
pcap_interface: {{ device }}
aggregate: src_host, dst_host
plugins: sqlite3[traffic]
sql_db[traffic]: {{ conf_dir }}/traffic.db
sql_table[traffic]: acct_v9
sql_history[traffic]: 5m
sql_history_roundoff[traffic]: m
sql_cache_entries: {{ sql_cache_entries }}
plugin_buffer_size: {{ plugin_buffer_size }}
plugin_pipe_size: {{ plugin_pipe_size }}
aggregate_filter: {{ bpf_filter }}
"#;

/// Render `pmacctd.conf` for one instance (spec §4.6 step 3/paragraph 2).
pub fn render_pmacctd_conf(
    instance: &Instance,
    conf_dir: &str,
    device: &str,
) -> Result<String, CoreError> {
    let sizing = buffer_sizing(instance.resources.bandwidth_mbps);
    let filter = bpf_filter(instance.private_ip.as_deref(), instance.public_ipv6.as_deref());

    let mut ctx = Context::new();
    ctx.insert("conf_dir", conf_dir);
    ctx.insert("device", device);
    ctx.insert("sql_cache_entries", &sizing.sql_cache_entries);
    ctx.insert("plugin_buffer_size", &sizing.plugin_buffer_size);
    ctx.insert("plugin_pipe_size", &sizing.plugin_pipe_size);
    ctx.insert("bpf_filter", &filter);

    Tera::one_off(PMACCTD_CONF_TEMPLATE, &ctx, false)
        .map_err(|_| CoreError::redacted("pmacct", "failed to render pmacctd.conf"))
}

/// DDL for the SQLite DB pmacctd writes into (spec §4.6 step 4): an `acct_v9`
/// table that mirrors `src_host`/`dst_host` onto `ip_src`/`ip_dst` via a
/// trigger, indexed on `stamp_inserted` and the host columns.
pub const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS acct_v9 (
    stamp_inserted TEXT,
    stamp_updated TEXT,
    src_host TEXT,
    dst_host TEXT,
    ip_src TEXT,
    ip_dst TEXT,
    bytes INTEGER,
    packets INTEGER
);
CREATE INDEX IF NOT EXISTS idx_acct_v9_stamp ON acct_v9(stamp_inserted);
CREATE INDEX IF NOT EXISTS idx_acct_v9_hosts ON acct_v9(src_host, dst_host);
CREATE TRIGGER IF NOT EXISTS acct_v9_mirror_hosts AFTER INSERT ON acct_v9
BEGIN
    UPDATE acct_v9 SET ip_src = COALESCE(NEW.ip_src, NEW.src_host),
                        ip_dst = COALESCE(NEW.ip_dst, NEW.dst_host)
    WHERE rowid = NEW.rowid;
END;
"#;

/// Per-instance config directory (spec §4.6 step 3).
pub fn conf_dir(instance_name: &str) -> String {
    format!("/var/lib/pmacct/{instance_name}")
}

/// Installs and starts the per-instance monitor end to end (spec §4.6
/// "Installation" steps 1-5). Returns the device the config was bound to.
pub fn install(
    ssh: &SshPool,
    params: &ConnectParams,
    instance: &Instance,
    device: &str,
) -> Result<(), CoreError> {
    let init = InitSystem::detect(ssh, params)?;
    let already = ssh.exec(params, already_installed_check())?.success();
    if !already {
        let distro = Distro::detect(ssh, params)?;
        let dnf_available = ssh.exec(params, "command -v dnf")?.success();
        ssh.exec_stdout(params, distro.install_command(dnf_available))?;
    }

    let dir = conf_dir(&instance.name);
    ssh.exec_stdout(params, &format!("mkdir -p {dir}"))?;

    let conf = render_pmacctd_conf(instance, &dir, device)?;
    fv_ssh::upload_file(ssh, params, &format!("{dir}/pmacctd.conf"), conf.as_bytes(), 0o644)?;

    let init_sql = format!("sqlite3 {dir}/traffic.db \"{}\"", SQLITE_SCHEMA.replace('"', "\\\""));
    ssh.exec_stdout(params, &init_sql)?;

    if let Some((path, content)) = init.unit_file(&instance.name, &dir) {
        fv_ssh::upload_file(ssh, params, &path, content.as_bytes(), 0o644)?;
    }
    ssh.exec_stdout(params, &init.start_command(&instance.name, &dir))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizing_follows_the_three_calibration_points() {
        assert_eq!(buffer_sizing(50).sql_cache_entries, 32);
        assert_eq!(buffer_sizing(1000).sql_cache_entries, 512);
        assert_eq!(buffer_sizing(3000).sql_cache_entries, 1024);
    }

    #[test]
    fn bpf_filter_excludes_internal_ranges_and_matches_monitored_hosts() {
        let filter = bpf_filter(Some("10.20.30.40"), None);
        assert!(filter.contains("not (net 10.0.0.0/8"));
        assert!(filter.contains("host 10.20.30.40"));
    }

    #[test]
    fn bpf_filter_with_no_monitored_hosts_is_just_the_exclusion() {
        let filter = bpf_filter(None, None);
        assert!(!filter.contains("host"));
    }

    #[test]
    fn bpf_filter_with_both_v4_and_v6_ors_the_hosts() {
        let filter = bpf_filter(Some("10.0.0.5"), Some("2001:db8::1"));
        assert!(filter.contains("host 10.0.0.5 or host 2001:db8::1"));
    }

    #[test]
    fn systemd_unit_names_after_the_instance() {
        let (path, content) = InitSystem::Systemd.unit_file("ct-alice-1", "/var/lib/pmacct/ct-alice-1").unwrap();
        assert_eq!(path, "/etc/systemd/system/pmacctd-ct-alice-1.service");
        assert!(content.contains("pmacctd -f /var/lib/pmacct/ct-alice-1/pmacctd.conf"));
    }

    #[test]
    fn nohup_has_no_unit_file() {
        assert!(InitSystem::Nohup.unit_file("ct-alice-1", "/var/lib/pmacct/ct-alice-1").is_none());
    }

    #[test]
    fn rhel_prefers_dnf_when_available() {
        assert_eq!(Distro::RhelLike.install_command(true), "dnf install -y pmacct sqlite");
        assert_eq!(Distro::RhelLike.install_command(false), "yum install -y pmacct sqlite");
    }
}
