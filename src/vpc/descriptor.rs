//! Persisted VPC and subnet descriptors

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Settled lifecycle state recorded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VpcState {
    /// VPC exists with no subnets
    #[default]
    Created,
    /// VPC has at least one subnet
    Ready,
}

impl fmt::Display for VpcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpcState::Created => write!(f, "Created"),
            VpcState::Ready => write!(f, "Ready"),
        }
    }
}

/// Whether a subnet may reach beyond its VPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    Public,
    #[default]
    Private,
}

impl fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetKind::Public => write!(f, "public"),
            SubnetKind::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatState {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<String>,
}

impl NatState {
    /// Uplink in use, if NAT is enabled
    pub fn active_uplink(&self) -> Option<&str> {
        if self.enabled {
            self.uplink.as_deref()
        } else {
            None
        }
    }
}

/// Virtual cable pair of a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CablePair {
    /// End attached to the VPC switch
    pub host_end: String,
    /// End moved into the subnet namespace
    pub namespace_end: String,
}

/// Workload metadata
///
/// Data only: vpcctl reads and writes it with the descriptor but never
/// deploys or checks a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(dead_code)]
pub struct Workload {
    pub port: u16,
    pub alive: bool,
}

/// Record of the last applied ingress policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStamp {
    pub rules: usize,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetDescriptor {
    pub name: String,
    pub cidr: Ipv4Net,
    pub kind: SubnetKind,
    pub address: Ipv4Addr,
    pub namespace_id: String,
    pub cable: CablePair,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<Workload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyStamp>,
}

/// Link between two VPC switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peering {
    pub peer: String,
    pub peer_cidr: Ipv4Net,
    /// Cable end attached to this VPC's switch
    pub local_link: String,
    /// Cable end attached to the peer's switch
    pub remote_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcDescriptor {
    pub name: String,
    pub cidr: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub switch: String,
    #[serde(default)]
    pub state: VpcState,
    #[serde(default)]
    pub nat: NatState,
    /// Subnets in creation order
    #[serde(default)]
    pub subnets: Vec<SubnetDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<Peering>,
    pub created_at: DateTime<Utc>,
}

impl VpcDescriptor {
    pub fn subnet(&self, name: &str) -> Option<&SubnetDescriptor> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn subnet_mut(&mut self, name: &str) -> Option<&mut SubnetDescriptor> {
        self.subnets.iter_mut().find(|s| s.name == name)
    }

    pub fn subnet_by_cidr(&self, cidr: &Ipv4Net) -> Option<&SubnetDescriptor> {
        self.subnets.iter().find(|s| s.cidr == *cidr)
    }

    pub fn peering(&self, peer: &str) -> Option<&Peering> {
        self.peerings.iter().find(|p| p.peer == peer)
    }

    /// Name and network of every subnet, for sibling validation
    pub fn sibling_networks(&self) -> impl Iterator<Item = (&str, &Ipv4Net)> {
        self.subnets.iter().map(|s| (s.name.as_str(), &s.cidr))
    }

    /// Whether host forwarding must be on for this VPC to work
    pub fn needs_forwarding(&self) -> bool {
        self.nat.enabled || !self.peerings.is_empty()
    }
}
