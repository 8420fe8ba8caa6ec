use uuid::Uuid;

use crate::error::CoreError;

/// Validate a provider/instance name component: lowercase alphanumeric + hyphens,
/// 1-63 chars, matching the DNS-label-like constraints hypervisor CLIs impose on
/// container/VM names.
pub fn validate_name(name: &str, kind: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.len() > 63 {
        return Err(CoreError::ValidationFailed {
            reason: format!("{kind} name must be 1-63 characters, got {}", name.len()),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(CoreError::ValidationFailed {
            reason: format!("{kind} name must be lowercase alphanumeric + hyphens: {name:?}"),
        });
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(CoreError::ValidationFailed {
            reason: format!("{kind} name must not start or end with a hyphen: {name:?}"),
        });
    }
    Ok(())
}

/// Generate a unique instance name: `<prefix>-<8 hex chars>`.
pub fn generate_instance_name(prefix: &str) -> String {
    let id = Uuid::new_v4();
    let bytes = id.as_bytes();
    format!(
        "{prefix}-{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Generate a new session id for a resource reservation (spec §3).
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the unique remote script path used for one-shot SSH script execution
/// (spec §4.1): `/tmp/<uuid>.sh`.
pub fn remote_script_path() -> String {
    format!("/tmp/{}.sh", Uuid::new_v4())
}

/// Derive the internal IP for a Proxmox VMID, per spec §4.3 step 3:
/// `172.16.1.<((id-100) mod 253) + 2>`.
pub fn vmid_to_internal_ip(vmid: u32) -> String {
    let offset = ((vmid - 100) % 253) + 2;
    format!("172.16.1.{offset}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_accepts_simple_names() {
        assert!(validate_name("ct-alice-1", "Instance").is_ok());
        assert!(validate_name("a", "Instance").is_ok());
    }

    #[test]
    fn validate_name_rejects_bad_shapes() {
        assert!(validate_name("", "Instance").is_err());
        assert!(validate_name("UPPER", "Instance").is_err());
        assert!(validate_name("-leading", "Instance").is_err());
        assert!(validate_name("trailing-", "Instance").is_err());
        assert!(validate_name(&"a".repeat(64), "Instance").is_err());
    }

    #[test]
    fn generate_instance_name_has_prefix_and_length() {
        let name = generate_instance_name("ct");
        assert!(name.starts_with("ct-"));
        assert_eq!(name.len(), "ct-".len() + 8);
    }

    #[test]
    fn vmid_to_internal_ip_matches_spec_formula() {
        // S1: empty node, first VMID 100 -> .2
        assert_eq!(vmid_to_internal_ip(100), "172.16.1.2");
        // S2: vmid=353 -> ((353-100) % 253) + 2 = (253 % 253) + 2 = 0 + 2 = 2
        assert_eq!(vmid_to_internal_ip(353), "172.16.1.2");
        assert_eq!(vmid_to_internal_ip(101), "172.16.1.3");
        assert_eq!(vmid_to_internal_ip(999), "172.16.1.142");
    }
}
