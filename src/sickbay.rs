//! Show, list and diagnose
//!
//! Read-only projections of the stored descriptors, each checked against the
//! live host. Drift is reported next to the data and never fails a command.

pub mod drift;

pub use drift::Drift;

use crate::control::{JournalEntry, NetworkControl, Presence};
use crate::error::Result;
use crate::store::ConfigStore;
use crate::vpc::{VpcDescriptor, VpcState};
use drift::{check_vpc, find_unrecorded};
use ipnet::Ipv4Net;
use serde::Serialize;

/// A descriptor together with its drift
#[derive(Debug, Serialize)]
pub struct VpcView {
    #[serde(flatten)]
    pub vpc: VpcDescriptor,
    pub drift: Vec<Drift>,
}

/// One row of `list`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcSummary {
    pub name: String,
    pub cidr: Ipv4Net,
    pub state: VpcState,
    pub subnets: usize,
    pub nat_uplink: Option<String>,
    pub peers: Vec<String>,
    pub drift: usize,
}

#[derive(Debug, Serialize)]
pub struct VpcHealth {
    pub name: String,
    pub drift: Vec<Drift>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub vpcs: Vec<VpcHealth>,
    /// Findings not tied to a readable descriptor
    pub host: Vec<Drift>,
    /// Host forwarding state; `None` if it could not be read
    pub forwarding: Option<bool>,
    /// Most recent failed external calls, oldest first
    pub recent_failures: Vec<JournalEntry>,
}

impl Diagnosis {
    pub fn findings(&self) -> usize {
        self.host.len() + self.vpcs.iter().map(|v| v.drift.len()).sum::<usize>()
    }

    pub fn is_healthy(&self) -> bool {
        self.findings() == 0
    }
}

pub struct Inspector<'a, C: NetworkControl> {
    ctl: &'a C,
    store: &'a ConfigStore,
    failure_limit: usize,
}

impl<'a, C: NetworkControl> Inspector<'a, C> {
    pub fn new(ctl: &'a C, store: &'a ConfigStore) -> Self {
        Self {
            ctl,
            store,
            failure_limit: 10,
        }
    }

    /// Number of journal failures `diagnose` reports
    pub fn with_failure_limit(mut self, limit: usize) -> Self {
        self.failure_limit = limit;
        self
    }

    pub fn show(&self, name: &str) -> Result<VpcView> {
        let vpc = self.store.load(name)?;
        let drift = check_vpc(self.ctl, &vpc);
        Ok(VpcView { vpc, drift })
    }

    /// Summaries of every readable descriptor
    pub fn list(&self) -> Result<Vec<VpcSummary>> {
        let (vpcs, unreadable) = self.load_readable()?;
        for finding in &unreadable {
            tracing::warn!("{}", finding);
        }

        Ok(vpcs
            .into_iter()
            .map(|vpc| {
                let drift = check_vpc(self.ctl, &vpc).len();
                VpcSummary {
                    nat_uplink: vpc.nat.active_uplink().map(str::to_string),
                    peers: vpc.peerings.iter().map(|p| p.peer.clone()).collect(),
                    subnets: vpc.subnets.len(),
                    name: vpc.name,
                    cidr: vpc.cidr,
                    state: vpc.state,
                    drift,
                }
            })
            .collect())
    }

    pub fn diagnose(&self) -> Result<Diagnosis> {
        let (vpcs, mut host) = self.load_readable()?;
        host.extend(find_unrecorded(self.ctl, &vpcs));

        let health = vpcs
            .iter()
            .map(|vpc| VpcHealth {
                name: vpc.name.clone(),
                drift: check_vpc(self.ctl, vpc),
            })
            .collect();

        let forwarding = match self.ctl.probe_forwarding() {
            Presence::Present => Some(true),
            Presence::Absent => Some(false),
            Presence::Unknown(_) => None,
        };

        let journal = self.store.read_journal()?;
        let mut recent_failures: Vec<JournalEntry> = journal
            .into_iter()
            .rev()
            .filter(|e| !e.success)
            .take(self.failure_limit)
            .collect();
        recent_failures.reverse();

        Ok(Diagnosis {
            vpcs: health,
            host,
            forwarding,
            recent_failures,
        })
    }

    /// Readable descriptors, plus a finding for each unreadable one
    fn load_readable(&self) -> Result<(Vec<VpcDescriptor>, Vec<Drift>)> {
        let (vpcs, unreadable) = self.store.load_all()?;
        let findings = unreadable
            .into_iter()
            .map(|(vpc, e)| Drift::Unreadable {
                vpc,
                error: e.to_string(),
            })
            .collect();
        Ok((vpcs, findings))
    }
}
