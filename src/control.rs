//! Network control interface
//!
//! The primitive host operations the orchestrator sequences: switches,
//! namespaces, cable pairs, addresses, routes, NAT and filter rules.
//! Implementations never fail with an error; every call reports an
//! [`Outcome`] and the caller decides what a failure means.
//!
//! Creation calls check before acting and deletion calls tolerate absence,
//! so a retried command converges on the same host state.

pub mod journal;
pub mod shell;

#[cfg(test)]
pub mod fake;

pub use journal::{Journal, JournalEntry};
pub use shell::ShellControl;

use crate::bulkhead::{Chain, FilterRule};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Result of a single primitive operation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Whether the operation reached its intended state
    pub success: bool,
    /// Captured stdout/stderr
    pub output: String,
    /// Exit status, if the operation ran a process that exited
    pub status: Option<i32>,
    /// Set when the call was abandoned after this many seconds
    pub timed_out_after: Option<u64>,
}

impl Outcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            status: Some(0),
            timed_out_after: None,
        }
    }

    pub fn failed(output: impl Into<String>, status: Option<i32>) -> Self {
        Self {
            success: false,
            output: output.into(),
            status,
            timed_out_after: None,
        }
    }

    pub fn timed_out(seconds: u64) -> Self {
        Self {
            success: false,
            output: format!("timed out after {} seconds", seconds),
            status: None,
            timed_out_after: Some(seconds),
        }
    }
}

/// Result of a read-only existence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// The check itself failed
    Unknown(Outcome),
}

/// Result of a read-only listing
pub type Listing = std::result::Result<Vec<String>, Outcome>;

/// Primitive host network operations
///
/// `ns` arguments select a namespace; `None` means the host namespace.
pub trait NetworkControl {
    // Switches
    fn create_switch(&self, name: &str) -> Outcome;
    fn delete_switch(&self, name: &str) -> Outcome;

    // Namespaces
    fn create_namespace(&self, ns: &str) -> Outcome;
    fn delete_namespace(&self, ns: &str) -> Outcome;

    // Cable pairs and interfaces
    fn create_cable(&self, end: &str, peer: &str) -> Outcome;
    /// Delete a cable pair by either end; removes both ends
    fn delete_cable(&self, end: &str) -> Outcome;
    fn attach_to_switch(&self, iface: &str, switch: &str) -> Outcome;
    fn move_to_namespace(&self, iface: &str, ns: &str) -> Outcome;
    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8, ns: Option<&str>) -> Outcome;
    fn set_up(&self, iface: &str, ns: Option<&str>) -> Outcome;
    fn add_default_route(&self, ns: &str, gateway: Ipv4Addr, iface: &str) -> Outcome;

    // NAT and forwarding
    fn add_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome;
    fn delete_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome;
    fn enable_forwarding(&self) -> Outcome;

    // Owned filter chains
    fn ensure_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome;
    fn add_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome;
    /// Like `add_filter_rule`, but places the rule at the head of its chain
    fn insert_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome;
    fn delete_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome;
    fn flush_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome;

    // Read-only probes
    fn probe_link(&self, name: &str, ns: Option<&str>) -> Presence;
    fn probe_namespace(&self, ns: &str) -> Presence;
    fn probe_masquerade(&self, source: Ipv4Net, uplink: &str) -> Presence;
    fn probe_forwarding(&self) -> Presence;
    fn list_switches(&self) -> Listing;
    fn list_namespaces(&self) -> Listing;
    /// Rules of an owned chain, one `-A ...` line each
    fn list_rules(&self, chain: Chain, ns: Option<&str>) -> Listing;
}
