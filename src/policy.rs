//! Ingress policy documents
//!
//! A policy document names a subnet by CIDR and lists ingress rules. It is
//! compiled into filter-rule operations on the subnet's owned ingress chain.
//! Nothing is validated lazily: every field is checked at compile time, so a
//! bad document never touches the live rule set.

use crate::bulkhead::{Chain, FilterRule, Protocol, Target};
use crate::error::{Error, Result};
use crate::network::parse_network;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Policy document as written by the operator
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(alias = "subnet")]
    pub subnet_cidr: String,
    #[serde(default)]
    pub ingress: Vec<IngressEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressEntry {
    pub port: i64,
    pub protocol: String,
    pub action: String,
}

impl PolicyDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidPolicy {
            field: "document".to_string(),
            value: e.to_string(),
            expected: "a JSON object with subnetCidr and ingress".to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidPolicy {
            field: "file".to_string(),
            value: format!("{}: {}", path.display(), e),
            expected: "a readable policy file".to_string(),
        })?;
        Self::from_json(&text)
    }
}

/// One step applied to a namespace's filter table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOp {
    EnsureChain(Chain),
    Flush(Chain),
    Append(FilterRule),
}

#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub subnet: Ipv4Net,
    pub ops: Vec<RuleOp>,
}

impl CompiledPolicy {
    pub fn rule_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, RuleOp::Append(_)))
            .count()
    }
}

fn invalid(field: String, value: impl ToString, expected: &str) -> Error {
    Error::InvalidPolicy {
        field,
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_protocol(index: usize, value: &str) -> Result<Protocol> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(invalid(format!("ingress[{}].protocol", index), value, "tcp or udp")),
    }
}

fn parse_action(index: usize, value: &str) -> Result<Target> {
    match value.to_ascii_lowercase().as_str() {
        "allow" => Ok(Target::Accept),
        "deny" => Ok(Target::Drop),
        _ => Err(invalid(format!("ingress[{}].action", index), value, "allow or deny")),
    }
}

fn parse_port(index: usize, value: i64) -> Result<u16> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(invalid(format!("ingress[{}].port", index), value, "a port in 1-65535")),
    }
}

/// Compile a document into ordered rule operations
///
/// The sequence is: ensure the ingress chain, flush it, append each rule in
/// document order. A repeated entry is appended once, at its first
/// position, so the rule count matches what the chain holds. Applying it
/// twice yields the same rule set.
pub fn compile(doc: &PolicyDocument) -> Result<CompiledPolicy> {
    let subnet = parse_network(&doc.subnet_cidr)
        .map_err(|v| invalid("subnetCidr".to_string(), &doc.subnet_cidr, &v.to_string()))?;

    let mut ops = vec![
        RuleOp::EnsureChain(Chain::Ingress),
        RuleOp::Flush(Chain::Ingress),
    ];

    let mut seen = HashSet::new();
    for (i, entry) in doc.ingress.iter().enumerate() {
        let protocol = parse_protocol(i, &entry.protocol)?;
        let target = parse_action(i, &entry.action)?;
        let port = parse_port(i, entry.port)?;
        let rule = FilterRule::new(Chain::Ingress, target).with_port(protocol, port);
        if !seen.insert(rule.clone()) {
            tracing::debug!(entry = i, rule = %rule, "duplicate ingress entry skipped");
            continue;
        }
        ops.push(RuleOp::Append(rule));
    }

    Ok(CompiledPolicy { subnet, ops })
}
