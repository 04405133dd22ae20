//! Drift between stored descriptors and the live host

use crate::bulkhead::{Chain, FilterRule, isolation_rules};
use crate::control::{NetworkControl, Presence};
use crate::network::Names;
use crate::network::naming::NAMESPACE_PREFIX;
use crate::vpc::VpcDescriptor;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// One mismatch between what is recorded and what the host has
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Drift {
    /// Recorded but not present
    Missing { resource: &'static str, name: String },
    /// Present with this tool's naming but recorded by no descriptor
    Unrecorded { resource: &'static str, name: String },
    /// Live ingress rules differ from the last applied policy
    RuleCount {
        namespace: String,
        recorded: usize,
        live: usize,
    },
    /// NAT or peering is enabled while host forwarding is off
    ForwardingOff { vpc: String },
    /// The probe itself failed
    Unverifiable {
        resource: &'static str,
        name: String,
        output: String,
    },
    /// A descriptor file could not be parsed
    Unreadable { vpc: String, error: String },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drift::Missing { resource, name } => {
                write!(f, "{} {} is recorded but missing from the host", resource, name)
            }
            Drift::Unrecorded { resource, name } => {
                write!(f, "{} {} exists on the host but no VPC records it", resource, name)
            }
            Drift::RuleCount {
                namespace,
                recorded,
                live,
            } => write!(
                f,
                "namespace {} has {} ingress rules, last applied policy had {}",
                namespace, live, recorded
            ),
            Drift::ForwardingOff { vpc } => {
                write!(f, "VPC {} needs host forwarding but it is disabled", vpc)
            }
            Drift::Unverifiable {
                resource,
                name,
                output,
            } => write!(f, "could not check {} {}: {}", resource, name, output),
            Drift::Unreadable { vpc, error } => {
                write!(f, "descriptor of VPC {} is unreadable: {}", vpc, error)
            }
        }
    }
}

/// Record a probe result; returns whether the resource is present
fn note(findings: &mut Vec<Drift>, resource: &'static str, name: &str, presence: Presence) -> bool {
    match presence {
        Presence::Present => true,
        Presence::Absent => {
            findings.push(Drift::Missing {
                resource,
                name: name.to_string(),
            });
            false
        }
        Presence::Unknown(outcome) => {
            findings.push(Drift::Unverifiable {
                resource,
                name: name.to_string(),
                output: outcome.output.trim().to_string(),
            });
            false
        }
    }
}

/// Probe every live resource a descriptor references
pub fn check_vpc<C: NetworkControl>(ctl: &C, vpc: &VpcDescriptor) -> Vec<Drift> {
    let mut findings = Vec::new();

    note(&mut findings, "switch", &vpc.switch, ctl.probe_link(&vpc.switch, None));

    match ctl.list_rules(Chain::Forward, None) {
        Ok(lines) => {
            let live: Vec<FilterRule> = lines.iter().filter_map(|l| FilterRule::parse(l)).collect();
            for rule in isolation_rules(&vpc.switch) {
                if !live.contains(&rule) {
                    findings.push(Drift::Missing {
                        resource: "isolation rule",
                        name: rule.to_string(),
                    });
                }
            }
        }
        Err(outcome) => findings.push(Drift::Unverifiable {
            resource: "forward chain",
            name: vpc.switch.clone(),
            output: outcome.output.trim().to_string(),
        }),
    }

    for subnet in &vpc.subnets {
        let ns = subnet.namespace_id.as_str();
        let cable = &subnet.cable;

        note(&mut findings, "cable end", &cable.host_end, ctl.probe_link(&cable.host_end, None));
        if !note(&mut findings, "namespace", ns, ctl.probe_namespace(ns)) {
            continue;
        }
        note(
            &mut findings,
            "cable end",
            &cable.namespace_end,
            ctl.probe_link(&cable.namespace_end, Some(ns)),
        );

        if let Some(stamp) = &subnet.policy {
            match ctl.list_rules(Chain::Ingress, Some(ns)) {
                Ok(rules) if rules.len() != stamp.rules => findings.push(Drift::RuleCount {
                    namespace: ns.to_string(),
                    recorded: stamp.rules,
                    live: rules.len(),
                }),
                Ok(_) => {}
                Err(outcome) => findings.push(Drift::Unverifiable {
                    resource: "ingress chain",
                    name: ns.to_string(),
                    output: outcome.output.trim().to_string(),
                }),
            }
        }
    }

    if let Some(uplink) = vpc.nat.active_uplink() {
        note(
            &mut findings,
            "masquerade rule",
            &format!("{} via {}", vpc.cidr, uplink),
            ctl.probe_masquerade(vpc.cidr, uplink),
        );
    }

    for peering in &vpc.peerings {
        note(
            &mut findings,
            "peering link",
            &peering.local_link,
            ctl.probe_link(&peering.local_link, None),
        );
    }

    if vpc.needs_forwarding() && ctl.probe_forwarding() == Presence::Absent {
        findings.push(Drift::ForwardingOff {
            vpc: vpc.name.clone(),
        });
    }

    findings
}

/// Switches and namespaces named like ours that no descriptor records
pub fn find_unrecorded<C: NetworkControl>(ctl: &C, vpcs: &[VpcDescriptor]) -> Vec<Drift> {
    let switches: BTreeSet<&str> = vpcs.iter().map(|v| v.switch.as_str()).collect();
    let namespaces: BTreeSet<&str> = vpcs
        .iter()
        .flat_map(|v| v.subnets.iter().map(|s| s.namespace_id.as_str()))
        .collect();

    let mut findings = Vec::new();

    match ctl.list_switches() {
        Ok(live) => findings.extend(
            live.into_iter()
                .filter(|name| Names::is_switch(name) && !switches.contains(name.as_str()))
                .map(|name| Drift::Unrecorded {
                    resource: "switch",
                    name,
                }),
        ),
        Err(outcome) => findings.push(Drift::Unverifiable {
            resource: "switches",
            name: "on host".to_string(),
            output: outcome.output.trim().to_string(),
        }),
    }

    match ctl.list_namespaces() {
        Ok(live) => findings.extend(
            live.into_iter()
                .filter(|ns| ns.starts_with(NAMESPACE_PREFIX) && !namespaces.contains(ns.as_str()))
                .map(|name| Drift::Unrecorded {
                    resource: "namespace",
                    name,
                }),
        ),
        Err(outcome) => findings.push(Drift::Unverifiable {
            resource: "namespaces",
            name: "on host".to_string(),
            output: outcome.output.trim().to_string(),
        }),
    }

    findings
}
