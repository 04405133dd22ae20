//! Unified error types for vpcctl

use ipnet::Ipv4Net;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// A single reason an address or CIDR was rejected
///
/// Produced by the address calculus and collected by the validator, so one
/// request can report every problem at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("invalid CIDR '{input}': {reason}")]
    InvalidCidr { input: String, reason: String },

    #[error(
        "subnet {inner} is not contained in VPC network {outer} \
         (expected a range within {}-{}, got {}-{})",
        .outer.network(), .outer.broadcast(), .inner.network(), .inner.broadcast()
    )]
    Containment { outer: Ipv4Net, inner: Ipv4Net },

    #[error(
        "{candidate} overlaps existing network '{sibling}' ({existing}) \
         (shared range {}-{})",
        std::cmp::max(.candidate.network(), .existing.network()),
        std::cmp::min(.candidate.broadcast(), .existing.broadcast())
    )]
    Overlap {
        candidate: Ipv4Net,
        sibling: String,
        existing: Ipv4Net,
    },

    #[error("host offset {offset} is out of range for {network} (expected 0..{usable}, got {offset})")]
    AddressOutOfRange {
        network: Ipv4Net,
        offset: u32,
        usable: u32,
    },

    #[error("host address {address} derived for {subnet} collides with VPC gateway {gateway}")]
    AddressConflict {
        subnet: Ipv4Net,
        address: Ipv4Addr,
        gateway: Ipv4Addr,
    },
}

impl Violation {
    /// Error kind name as shown to operators
    pub fn kind(&self) -> &'static str {
        match self {
            Violation::InvalidCidr { .. } => "InvalidCIDR",
            Violation::Containment { .. } => "ContainmentViolation",
            Violation::Overlap { .. } => "OverlapViolation",
            Violation::AddressOutOfRange { .. } => "AddressOutOfRange",
            Violation::AddressConflict { .. } => "AddressConflict",
        }
    }

    pub fn invalid_cidr(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Violation::InvalidCidr {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Aggregated validation outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    violations: Vec<Violation>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Check whether any violation has the given kind name
    #[cfg(test)]
    pub fn has(&self, kind: &str) -> bool {
        self.violations.iter().any(|v| v.kind() == kind)
    }

}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.violations.as_slice() {
            [] => write!(f, "no violations"),
            [single] => write!(f, "{}", single),
            many => {
                write!(f, "{} violations:", many.len())?;
                for v in many {
                    write!(f, "\n  - [{}] {}", v.kind(), v)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Violation> for Report {
    fn from(violation: Violation) -> Self {
        Self {
            violations: vec![violation],
        }
    }
}

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // State errors
    #[error("Failed to parse state file '{path}': {source}")]
    StateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to encode state: {0}")]
    StateEncode(#[from] serde_json::Error),

    #[error("Failed to acquire host lock '{path}': {message}")]
    Lock { path: PathBuf, message: String },

    // Validation errors
    #[error("{0}")]
    Rejected(Report),

    #[error("invalid VPC configuration: {0}")]
    InvalidVpc(Report),

    #[error("invalid policy: {field} is '{value}', expected {expected}")]
    InvalidPolicy {
        field: String,
        value: String,
        expected: String,
    },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    // Resource errors
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("no subnet in VPC '{vpc}' matches policy CIDR {cidr}")]
    UnknownSubnet { vpc: String, cidr: String },

    #[error("VPC '{vpc}' cannot {event} while {state}")]
    InvalidTransition {
        vpc: String,
        event: &'static str,
        state: String,
    },

    // External operation errors
    #[error("step '{step}' failed (exit status {}): {output}", status_label(.status))]
    ExternalOperationFailed {
        step: String,
        output: String,
        status: Option<i32>,
    },

    #[error("step '{step}' timed out after {seconds} seconds")]
    Timeout { step: String, seconds: u64 },

    #[error("Operation requires root privileges: {0}")]
    PermissionDenied(String),
}

fn status_label(status: &Option<i32>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl From<Violation> for Error {
    fn from(violation: Violation) -> Self {
        Error::Rejected(violation.into())
    }
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Error kind name as shown to operators and in `--json` output
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::ConfigRead { .. } | Error::ConfigParse(_) | Error::ConfigValidation(_) => {
                "InvalidConfig"
            }
            Error::StateParse { .. } | Error::StateEncode(_) => "StateCorrupt",
            Error::Lock { .. } => "Lock",
            Error::Rejected(report) => {
                let mut kinds = report.violations().iter().map(Violation::kind);
                match kinds.next() {
                    Some(first) if kinds.all(|k| k == first) => first,
                    _ => "InvalidConfig",
                }
            }
            Error::InvalidVpc(_) => "InvalidConfig",
            Error::InvalidPolicy { .. } => "InvalidPolicy",
            Error::InvalidName { .. } => "InvalidName",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::NotFound { .. } => "NotFound",
            Error::UnknownSubnet { .. } => "UnknownSubnet",
            Error::InvalidTransition { .. } => "InvalidTransition",
            Error::ExternalOperationFailed { .. } => "ExternalOperationFailed",
            Error::Timeout { .. } => "Timeout",
            Error::PermissionDenied(_) => "PermissionDenied",
        }
    }
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
