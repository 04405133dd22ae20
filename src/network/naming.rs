//! Host resource naming
//!
//! Linux interface names are capped at 15 bytes, so switch and cable names
//! are derived from a digest of the owning names. Names are deterministic:
//! the same VPC always maps to the same switch, which lets a retried delete
//! find resources even without a descriptor.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Prefix shared by every switch this tool creates
pub const SWITCH_PREFIX: &str = "vpc";

/// Prefix shared by every namespace this tool creates
pub const NAMESPACE_PREFIX: &str = "vpc-";

const MAX_NAME_LEN: usize = 32;
const MAX_IFACE_LEN: usize = 15;

/// Validate a VPC or subnet name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("expected 1-{} characters, got {}", MAX_NAME_LEN, name.len()),
        });
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("character {:?} not allowed (use letters, digits, '-' or '_')", bad),
        });
    }

    Ok(())
}

/// Validate a host interface name such as an uplink
pub fn validate_interface(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFACE_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("interface names are 1-{} bytes", MAX_IFACE_LEN),
        });
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "interface names cannot contain whitespace, '/' or ':'".to_string(),
        });
    }
    Ok(())
}

fn digest8(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"/");
        }
        hasher.update(part.as_bytes());
    }
    let hash = hex::encode(hasher.finalize());
    hash[..8].to_string()
}

/// Names of the host resources backing a VPC
pub struct Names;

impl Names {
    /// Switch (bridge) name for a VPC, e.g. `vpc1a2b3c4d`
    pub fn switch(vpc: &str) -> String {
        format!("{}{}", SWITCH_PREFIX, digest8(&[vpc]))
    }

    /// Namespace id for a subnet, e.g. `vpc-prod.web`
    ///
    /// `.` never appears in a valid name, so ids cannot collide across VPCs.
    pub fn namespace(vpc: &str, subnet: &str) -> String {
        format!("{}{}.{}", NAMESPACE_PREFIX, vpc, subnet)
    }

    /// Prefix shared by the namespace ids of every subnet of a VPC
    pub fn namespace_prefix(vpc: &str) -> String {
        format!("{}{}.", NAMESPACE_PREFIX, vpc)
    }

    /// Cable pair for a subnet: (switch side, namespace side)
    pub fn cable(vpc: &str, subnet: &str) -> (String, String) {
        let tag = digest8(&[vpc, subnet]);
        (format!("vh{}", tag), format!("vn{}", tag))
    }

    /// Cable end attached to `local`'s switch when peering with `remote`
    pub fn peer_link(local: &str, remote: &str) -> String {
        format!("vp{}", digest8(&["peer", local, remote]))
    }

    /// Check whether a host interface name looks like one of our switches
    pub fn is_switch(name: &str) -> bool {
        name.len() == SWITCH_PREFIX.len() + 8
            && name.starts_with(SWITCH_PREFIX)
            && name[SWITCH_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit())
    }
}
