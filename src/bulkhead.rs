//! Packet filter rules owned by vpcctl
//!
//! Rules never go into the built-in iptables chains directly. Each concern
//! has its own chain, hooked once from the built-in chain, so a flush only
//! ever touches rules this tool created.

use crate::network::naming::SWITCH_PREFIX;
use ipnet::Ipv4Net;
use std::fmt;

/// Chains owned by vpcctl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    /// Inbound policy of a subnet namespace
    Ingress,
    /// Outbound restriction of a private subnet namespace
    Egress,
    /// Host forwarding for NAT and peering
    Forward,
}

impl Chain {
    pub fn name(&self) -> &'static str {
        match self {
            Chain::Ingress => "VPCCTL-INGRESS",
            Chain::Egress => "VPCCTL-EGRESS",
            Chain::Forward => "VPCCTL-FORWARD",
        }
    }

    pub fn from_name(name: &str) -> Option<Chain> {
        [Chain::Ingress, Chain::Egress, Chain::Forward]
            .into_iter()
            .find(|chain| chain.name() == name)
    }

    /// Built-in chain that jumps into this one
    pub fn hook(&self) -> &'static str {
        match self {
            Chain::Ingress => "INPUT",
            Chain::Egress => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transport protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Rule verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Accept,
    Drop,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
        }
    }
}

/// A filter rule in one of the owned chains
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterRule {
    pub chain: Chain,
    pub protocol: Option<Protocol>,
    pub dport: Option<u16>,
    pub source: Option<Ipv4Net>,
    pub destination: Option<Ipv4Net>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    /// Match only replies to established flows
    pub established: bool,
    pub target: Target,
}

impl FilterRule {
    /// Create a rule matching everything in `chain`
    pub fn new(chain: Chain, target: Target) -> Self {
        Self {
            chain,
            protocol: None,
            dport: None,
            source: None,
            destination: None,
            in_iface: None,
            out_iface: None,
            established: false,
            target,
        }
    }

    pub fn with_port(mut self, protocol: Protocol, port: u16) -> Self {
        self.protocol = Some(protocol);
        self.dport = Some(port);
        self
    }

    pub fn src(mut self, net: Ipv4Net) -> Self {
        self.source = Some(net);
        self
    }

    pub fn dst(mut self, net: Ipv4Net) -> Self {
        self.destination = Some(net);
        self
    }

    pub fn in_iface(mut self, iface: &str) -> Self {
        self.in_iface = Some(iface.to_string());
        self
    }

    pub fn out_iface(mut self, iface: &str) -> Self {
        self.out_iface = Some(iface.to_string());
        self
    }

    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }

    /// Match arguments and jump target, without the chain or command flag
    ///
    /// Used after `-A <chain>`, `-C <chain>` or `-D <chain>`.
    pub fn to_iptables_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(source) = &self.source {
            args.extend(["-s".to_string(), source.to_string()]);
        }
        if let Some(destination) = &self.destination {
            args.extend(["-d".to_string(), destination.to_string()]);
        }
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(protocol) = self.protocol {
            args.extend(["-p".to_string(), protocol.as_str().to_string()]);
        }
        if let Some(port) = self.dport {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        if self.established {
            args.extend(
                ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        args.extend(["-j".to_string(), self.target.as_str().to_string()]);

        args
    }
}

impl FilterRule {
    /// Parse one `-A <chain> ...` line as printed by `iptables -S`
    ///
    /// Understands the matches vpcctl writes, plus the implicit `-m tcp`
    /// iptables adds to port rules. Anything else yields `None`.
    pub fn parse(line: &str) -> Option<FilterRule> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "-A" {
            return None;
        }
        let mut rule = FilterRule::new(Chain::from_name(tokens.next()?)?, Target::Accept);
        let mut target = None;

        while let Some(token) = tokens.next() {
            match token {
                "-s" => rule.source = Some(tokens.next()?.parse().ok()?),
                "-d" => rule.destination = Some(tokens.next()?.parse().ok()?),
                "-i" => rule.in_iface = Some(tokens.next()?.to_string()),
                "-o" => rule.out_iface = Some(tokens.next()?.to_string()),
                "-p" => {
                    rule.protocol = Some(match tokens.next()? {
                        "tcp" => Protocol::Tcp,
                        "udp" => Protocol::Udp,
                        _ => return None,
                    })
                }
                "--dport" => rule.dport = Some(tokens.next()?.parse().ok()?),
                "-m" => match tokens.next()? {
                    "tcp" | "udp" => {}
                    "conntrack" => {
                        if tokens.next()? != "--ctstate" || tokens.next()? != "RELATED,ESTABLISHED" {
                            return None;
                        }
                        rule.established = true;
                    }
                    _ => return None,
                },
                "-j" => {
                    target = Some(match tokens.next()? {
                        "ACCEPT" => Target::Accept,
                        "DROP" => Target::Drop,
                        _ => return None,
                    })
                }
                _ => return None,
            }
        }

        rule.target = target?;
        Some(rule)
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, self.to_iptables_args().join(" "))
    }
}

/// Forwarding rules that let a VPC reach its uplink and receive replies
pub fn nat_forward_rules(switch: &str, uplink: &str) -> [FilterRule; 2] {
    [
        FilterRule::new(Chain::Forward, Target::Accept)
            .in_iface(switch)
            .out_iface(uplink),
        FilterRule::new(Chain::Forward, Target::Accept)
            .in_iface(uplink)
            .out_iface(switch)
            .established(),
    ]
}

/// Forwarding rules that keep a VPC off every other VPC switch
///
/// Appended when the VPC is created. Peering accepts go in at the head of
/// the chain so they are matched first.
pub fn isolation_rules(switch: &str) -> [FilterRule; 2] {
    let any_switch = format!("{}+", SWITCH_PREFIX);
    [
        FilterRule::new(Chain::Forward, Target::Accept)
            .in_iface(switch)
            .out_iface(switch),
        FilterRule::new(Chain::Forward, Target::Drop)
            .in_iface(switch)
            .out_iface(&any_switch),
    ]
}

/// Forwarding rules that let two peered VPCs reach each other
pub fn peering_forward_rules(a: Ipv4Net, b: Ipv4Net) -> [FilterRule; 2] {
    [
        FilterRule::new(Chain::Forward, Target::Accept)
            .src(a)
            .dst(b),
        FilterRule::new(Chain::Forward, Target::Accept)
            .src(b)
            .dst(a),
    ]
}

/// Egress rules of a private subnet: VPC-internal traffic only
pub fn private_egress_rules(vpc: Ipv4Net) -> [FilterRule; 3] {
    [
        FilterRule::new(Chain::Egress, Target::Accept).out_iface("lo"),
        FilterRule::new(Chain::Egress, Target::Accept).dst(vpc),
        FilterRule::new(Chain::Egress, Target::Drop),
    ]
}
