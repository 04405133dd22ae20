//! Validation of create requests
//!
//! Runs before any host mutation. Subnet validation collects every
//! violation instead of stopping at the first one.

use crate::error::{Report, Violation};
use crate::network::cidr::{self, contains, overlaps};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Accepted VPC create request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpcPlan {
    pub network: Ipv4Net,
    pub gateway: Ipv4Addr,
}

/// Accepted subnet create request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPlan {
    pub network: Ipv4Net,
    pub address: Ipv4Addr,
}

/// Validate the CIDR of a new VPC
///
/// Rejects malformed text and networks with no usable host for the gateway.
pub fn validate_vpc_create(cidr_text: &str) -> Result<VpcPlan, Report> {
    let network = cidr::parse_network(cidr_text)?;
    let gateway = cidr::gateway_address(&network)?;
    Ok(VpcPlan { network, gateway })
}

/// Validate the CIDR of a new subnet against its VPC and siblings
///
/// `siblings` pairs each existing subnet name with its network. The derived
/// host address (at `host_offset`) must exist and must not be the VPC gateway.
pub fn validate_subnet_create<'a>(
    vpc: &Ipv4Net,
    gateway: Ipv4Addr,
    cidr_text: &str,
    siblings: impl IntoIterator<Item = (&'a str, &'a Ipv4Net)>,
    host_offset: u32,
) -> Result<SubnetPlan, Report> {
    let network = cidr::parse_network(cidr_text).map_err(Report::from)?;
    let mut report = Report::new();

    if !contains(vpc, &network) {
        report.push(Violation::Containment {
            outer: *vpc,
            inner: network,
        });
    }

    for (name, existing) in siblings {
        if overlaps(&network, existing) {
            report.push(Violation::Overlap {
                candidate: network,
                sibling: name.to_string(),
                existing: *existing,
            });
        }
    }

    let address = match cidr::host_address(&network, host_offset) {
        Ok(address) => Some(address),
        Err(violation) => {
            report.push(violation);
            None
        }
    };

    if let Some(address) = address
        && address == gateway
    {
        report.push(Violation::AddressConflict {
            subnet: network,
            address,
            gateway,
        });
    }

    match address {
        Some(address) if report.is_empty() => Ok(SubnetPlan { network, address }),
        _ => Err(report),
    }
}
