//! One module per hypervisor family (spec §4.2 "Adapter per hypervisor").

pub mod docker;
pub mod lxd;
pub mod proxmox;

/// Parse `"512m"`/`"5g"`-style spec strings into whole megabytes, the unit
/// Proxmox's `pct`/`qm` CLIs and API both want for memory and disk sizes.
pub fn parse_size_to_mb(spec: &str) -> Option<u64> {
    let spec = spec.trim().to_ascii_lowercase();
    let (digits, unit) = spec.split_at(spec.find(|c: char| !c.is_ascii_digit())?);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "m" | "mb" => Some(n),
        "g" | "gb" => Some(n * 1024),
        "" => Some(n),
        _ => None,
    }
}

/// Parse the same spec strings into bytes with an explicit suffix, the form
/// LXD's `limits.memory`/device `size` fields want.
pub fn parse_size_to_lxd(spec: &str) -> Option<String> {
    let spec = spec.trim().to_ascii_lowercase();
    let (digits, unit) = spec.split_at(spec.find(|c: char| !c.is_ascii_digit())?);
    digits.parse::<u64>().ok()?;
    match unit {
        "m" | "mb" => Some(format!("{digits}MB")),
        "g" | "gb" => Some(format!("{digits}GB")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mb_and_gb_to_mb() {
        assert_eq!(parse_size_to_mb("512m"), Some(512));
        assert_eq!(parse_size_to_mb("5g"), Some(5120));
        assert_eq!(parse_size_to_mb("2048"), Some(2048));
    }

    #[test]
    fn parses_to_lxd_suffixed_form() {
        assert_eq!(parse_size_to_lxd("512m"), Some("512MB".to_string()));
        assert_eq!(parse_size_to_lxd("5g"), Some("5GB".to_string()));
    }
}
