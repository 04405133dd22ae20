//! In-memory network control for tests
//!
//! Models just enough host state to check that operations converge and that
//! failed operations leave nothing behind. Failures and timeouts can be
//! injected per operation name.

use super::{Listing, NetworkControl, Outcome, Presence};
use crate::bulkhead::{Chain, FilterRule, Target};
use ipnet::Ipv4Net;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub peer: Option<String>,
    pub namespace: Option<String>,
    pub master: Option<String>,
    pub up: bool,
    pub addrs: Vec<String>,
}

/// Simulated host network state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub switches: BTreeSet<String>,
    pub switches_up: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub links: BTreeMap<String, Link>,
    pub routes: BTreeMap<String, Ipv4Addr>,
    pub masquerades: BTreeSet<(Ipv4Net, String)>,
    pub forwarding: bool,
    pub chains: BTreeMap<(Option<String>, Chain), Vec<FilterRule>>,
}

impl HostState {
    /// True when nothing created by an operation remains
    ///
    /// Empty owned chains and the forwarding flag are host-wide settings and
    /// do not count as leftovers.
    pub fn is_clean(&self) -> bool {
        self.switches.is_empty()
            && self.namespaces.is_empty()
            && self.links.is_empty()
            && self.routes.is_empty()
            && self.masquerades.is_empty()
            && self.chains.values().all(Vec::is_empty)
    }

    /// Verdict of the first host forward rule matching a new flow
    ///
    /// `None` means no owned rule matched and the built-in policy decides.
    pub fn forward_verdict(
        &self,
        in_iface: &str,
        out_iface: &str,
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Option<Target> {
        self.chains
            .get(&(None, Chain::Forward))?
            .iter()
            .find(|rule| {
                !rule.established
                    && rule.protocol.is_none()
                    && rule.in_iface.as_deref().is_none_or(|p| iface_matches(p, in_iface))
                    && rule.out_iface.as_deref().is_none_or(|p| iface_matches(p, out_iface))
                    && rule.source.is_none_or(|net| net.contains(&source))
                    && rule.destination.is_none_or(|net| net.contains(&destination))
            })
            .map(|rule| rule.target)
    }

    fn remove_link(&mut self, name: &str) {
        if let Some(link) = self.links.remove(name)
            && let Some(peer) = link.peer
        {
            self.links.remove(&peer);
        }
    }
}

/// iptables interface match; a trailing `+` matches any suffix
fn iface_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('+') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[derive(Debug, Clone)]
struct Injection {
    op: String,
    skip: usize,
    timeout: bool,
    /// Fire once, then let later calls through
    once: bool,
}

#[derive(Debug, Default)]
pub struct FakeControl {
    state: RefCell<HostState>,
    injections: RefCell<Vec<Injection>>,
    calls: RefCell<Vec<String>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of `op`
    pub fn fail(&self, op: &str) {
        self.fail_after(op, 0);
    }

    /// Let `skip` calls of `op` succeed, then fail the rest
    pub fn fail_after(&self, op: &str, skip: usize) {
        self.injections.borrow_mut().push(Injection {
            op: op.to_string(),
            skip,
            timeout: false,
            once: false,
        });
    }

    /// Fail only call number `n` of `op`, counting from 0
    pub fn fail_nth(&self, op: &str, n: usize) {
        self.injections.borrow_mut().push(Injection {
            op: op.to_string(),
            skip: n,
            timeout: false,
            once: true,
        });
    }

    /// Make every call of `op` time out
    pub fn time_out(&self, op: &str) {
        self.injections.borrow_mut().push(Injection {
            op: op.to_string(),
            skip: 0,
            timeout: true,
            once: false,
        });
    }

    pub fn clear_failures(&self) {
        self.injections.borrow_mut().clear();
    }

    pub fn state(&self) -> Ref<'_, HostState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, HostState> {
        self.state.borrow_mut()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    /// Record a call and return an injected outcome if one applies
    fn enter(&self, op: &str, detail: &str) -> Option<Outcome> {
        self.calls.borrow_mut().push(format!("{} {}", op, detail));

        let mut injections = self.injections.borrow_mut();
        let index = injections.iter().position(|i| i.op == op)?;
        let injection = &mut injections[index];
        if injection.skip > 0 {
            injection.skip -= 1;
            return None;
        }
        let outcome = if injection.timeout {
            Outcome::timed_out(10)
        } else {
            Outcome::failed(format!("injected failure in {}", op), Some(2))
        };
        if injection.once {
            injections.remove(index);
        }
        Some(outcome)
    }

    fn check_ns(state: &HostState, ns: Option<&str>) -> Option<Outcome> {
        match ns {
            Some(ns) if !state.namespaces.contains(ns) => Some(Outcome::failed(
                format!("Cannot open network namespace \"{}\": No such file or directory", ns),
                Some(1),
            )),
            _ => None,
        }
    }

    fn no_device(name: &str) -> Outcome {
        Outcome::failed(format!("Cannot find device \"{}\"", name), Some(1))
    }
}

impl NetworkControl for FakeControl {
    fn create_switch(&self, name: &str) -> Outcome {
        if let Some(outcome) = self.enter("create_switch", name) {
            return outcome;
        }
        self.state.borrow_mut().switches.insert(name.to_string());
        Outcome::ok("")
    }

    fn delete_switch(&self, name: &str) -> Outcome {
        if let Some(outcome) = self.enter("delete_switch", name) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        state.switches.remove(name);
        state.switches_up.remove(name);
        for link in state.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        Outcome::ok("")
    }

    fn create_namespace(&self, ns: &str) -> Outcome {
        if let Some(outcome) = self.enter("create_namespace", ns) {
            return outcome;
        }
        self.state.borrow_mut().namespaces.insert(ns.to_string());
        Outcome::ok("")
    }

    fn delete_namespace(&self, ns: &str) -> Outcome {
        if let Some(outcome) = self.enter("delete_namespace", ns) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        state.namespaces.remove(ns);
        state.routes.remove(ns);
        state.chains.retain(|(chain_ns, _), _| chain_ns.as_deref() != Some(ns));

        let inside: Vec<String> = state
            .links
            .iter()
            .filter(|(_, l)| l.namespace.as_deref() == Some(ns))
            .map(|(name, _)| name.clone())
            .collect();
        for name in inside {
            state.remove_link(&name);
        }
        Outcome::ok("")
    }

    fn create_cable(&self, end: &str, peer: &str) -> Outcome {
        if let Some(outcome) = self.enter("create_cable", end) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if state.links.contains_key(end) {
            return Outcome::ok("");
        }
        state.links.insert(
            end.to_string(),
            Link {
                peer: Some(peer.to_string()),
                ..Link::default()
            },
        );
        state.links.insert(
            peer.to_string(),
            Link {
                peer: Some(end.to_string()),
                ..Link::default()
            },
        );
        Outcome::ok("")
    }

    fn delete_cable(&self, end: &str) -> Outcome {
        if let Some(outcome) = self.enter("delete_cable", end) {
            return outcome;
        }
        self.state.borrow_mut().remove_link(end);
        Outcome::ok("")
    }

    fn attach_to_switch(&self, iface: &str, switch: &str) -> Outcome {
        if let Some(outcome) = self.enter("attach_to_switch", iface) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if !state.switches.contains(switch) {
            return Self::no_device(switch);
        }
        match state.links.get_mut(iface) {
            Some(link) if link.namespace.is_none() => {
                link.master = Some(switch.to_string());
                Outcome::ok("")
            }
            _ => Self::no_device(iface),
        }
    }

    fn move_to_namespace(&self, iface: &str, ns: &str) -> Outcome {
        if let Some(outcome) = self.enter("move_to_namespace", iface) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = Self::check_ns(&state, Some(ns)) {
            return outcome;
        }
        match state.links.get_mut(iface) {
            Some(link) => {
                link.namespace = Some(ns.to_string());
                link.master = None;
                link.up = false;
                Outcome::ok("")
            }
            None => Self::no_device(iface),
        }
    }

    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("assign_address", iface) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = Self::check_ns(&state, ns) {
            return outcome;
        }
        let cidr = format!("{}/{}", addr, prefix);
        if state.switches.contains(iface) && ns.is_none() {
            return Outcome::ok("");
        }
        match state.links.get_mut(iface) {
            Some(link) if link.namespace.as_deref() == ns => {
                if !link.addrs.contains(&cidr) {
                    link.addrs.push(cidr);
                }
                Outcome::ok("")
            }
            _ => Self::no_device(iface),
        }
    }

    fn set_up(&self, iface: &str, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("set_up", iface) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = Self::check_ns(&state, ns) {
            return outcome;
        }
        if ns.is_none() && state.switches.contains(iface) {
            state.switches_up.insert(iface.to_string());
            return Outcome::ok("");
        }
        if ns.is_some() && iface == "lo" {
            return Outcome::ok("");
        }
        match state.links.get_mut(iface) {
            Some(link) if link.namespace.as_deref() == ns => {
                link.up = true;
                Outcome::ok("")
            }
            _ => Self::no_device(iface),
        }
    }

    fn add_default_route(&self, ns: &str, gateway: Ipv4Addr, _iface: &str) -> Outcome {
        if let Some(outcome) = self.enter("add_default_route", ns) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = Self::check_ns(&state, Some(ns)) {
            return outcome;
        }
        state.routes.insert(ns.to_string(), gateway);
        Outcome::ok("")
    }

    fn add_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome {
        if let Some(outcome) = self.enter("add_masquerade", uplink) {
            return outcome;
        }
        self.state
            .borrow_mut()
            .masquerades
            .insert((source, uplink.to_string()));
        Outcome::ok("")
    }

    fn delete_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome {
        if let Some(outcome) = self.enter("delete_masquerade", uplink) {
            return outcome;
        }
        self.state
            .borrow_mut()
            .masquerades
            .remove(&(source, uplink.to_string()));
        Outcome::ok("")
    }

    fn enable_forwarding(&self) -> Outcome {
        if let Some(outcome) = self.enter("enable_forwarding", "") {
            return outcome;
        }
        self.state.borrow_mut().forwarding = true;
        Outcome::ok("")
    }

    fn ensure_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("ensure_chain", chain.name()) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = Self::check_ns(&state, ns) {
            return outcome;
        }
        state
            .chains
            .entry((ns.map(str::to_string), chain))
            .or_default();
        Outcome::ok("")
    }

    fn add_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("add_filter_rule", &rule.to_string()) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        match state.chains.get_mut(&(ns.map(str::to_string), rule.chain)) {
            Some(rules) => {
                if !rules.contains(rule) {
                    rules.push(rule.clone());
                }
                Outcome::ok("")
            }
            None => Outcome::failed("iptables: No chain/target/match by that name.", Some(1)),
        }
    }

    fn insert_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("insert_filter_rule", &rule.to_string()) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        match state.chains.get_mut(&(ns.map(str::to_string), rule.chain)) {
            Some(rules) => {
                if !rules.contains(rule) {
                    rules.insert(0, rule.clone());
                }
                Outcome::ok("")
            }
            None => Outcome::failed("iptables: No chain/target/match by that name.", Some(1)),
        }
    }

    fn delete_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("delete_filter_rule", &rule.to_string()) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(rules) = state.chains.get_mut(&(ns.map(str::to_string), rule.chain)) {
            rules.retain(|r| r != rule);
        }
        Outcome::ok("")
    }

    fn flush_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome {
        if let Some(outcome) = self.enter("flush_chain", chain.name()) {
            return outcome;
        }
        let mut state = self.state.borrow_mut();
        if let Some(rules) = state.chains.get_mut(&(ns.map(str::to_string), chain)) {
            rules.clear();
        }
        Outcome::ok("")
    }

    fn probe_link(&self, name: &str, ns: Option<&str>) -> Presence {
        let state = self.state.borrow();
        let present = match ns {
            None => {
                state.switches.contains(name)
                    || state
                        .links
                        .get(name)
                        .is_some_and(|l| l.namespace.is_none())
            }
            Some(ns) => state
                .links
                .get(name)
                .is_some_and(|l| l.namespace.as_deref() == Some(ns)),
        };
        if present {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    fn probe_namespace(&self, ns: &str) -> Presence {
        if self.state.borrow().namespaces.contains(ns) {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    fn probe_masquerade(&self, source: Ipv4Net, uplink: &str) -> Presence {
        if self
            .state
            .borrow()
            .masquerades
            .contains(&(source, uplink.to_string()))
        {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    fn probe_forwarding(&self) -> Presence {
        if self.state.borrow().forwarding {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    fn list_switches(&self) -> Listing {
        Ok(self.state.borrow().switches.iter().cloned().collect())
    }

    fn list_namespaces(&self) -> Listing {
        Ok(self.state.borrow().namespaces.iter().cloned().collect())
    }

    fn list_rules(&self, chain: Chain, ns: Option<&str>) -> Listing {
        Ok(self
            .state
            .borrow()
            .chains
            .get(&(ns.map(str::to_string), chain))
            .map(|rules| rules.iter().map(FilterRule::to_string).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_delete_takes_links_along() {
        let ctl = FakeControl::new();
        ctl.create_switch("vpc1");
        ctl.create_namespace("vpc-a-b");
        ctl.create_cable("vh1", "vn1");
        ctl.attach_to_switch("vh1", "vpc1");
        assert!(ctl.move_to_namespace("vn1", "vpc-a-b").success);

        ctl.delete_namespace("vpc-a-b");
        ctl.delete_switch("vpc1");
        assert!(ctl.state().is_clean());
    }

    #[test]
    fn test_injection_skip_then_fail() {
        let ctl = FakeControl::new();
        ctl.fail_after("create_namespace", 1);
        assert!(ctl.create_namespace("one").success);
        assert!(!ctl.create_namespace("two").success);
        assert_eq!(ctl.count("create_namespace"), 2);

        ctl.clear_failures();
        ctl.time_out("enable_forwarding");
        assert_eq!(ctl.enable_forwarding().timed_out_after, Some(10));

        ctl.clear_failures();
        ctl.fail_nth("create_switch", 1);
        assert!(ctl.create_switch("a").success);
        assert!(!ctl.create_switch("b").success);
        assert!(ctl.create_switch("c").success);
    }

    #[test]
    fn test_insert_puts_rule_first() {
        let ctl = FakeControl::new();
        ctl.ensure_chain(Chain::Forward, None);
        let drop = FilterRule::new(Chain::Forward, Target::Drop).in_iface("vpc1").out_iface("vpc+");
        let accept = FilterRule::new(Chain::Forward, Target::Accept).in_iface("vpc1").out_iface("vpc2");
        ctl.add_filter_rule(&drop, None);
        assert!(ctl.insert_filter_rule(&accept, None).success);
        assert!(ctl.insert_filter_rule(&accept, None).success);

        let state = ctl.state();
        assert_eq!(state.chains[&(None, Chain::Forward)], vec![accept, drop]);
        let any: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert_eq!(state.forward_verdict("vpc1", "vpc2", any, any), Some(Target::Accept));
        assert_eq!(state.forward_verdict("vpc1", "vpc3", any, any), Some(Target::Drop));
        assert_eq!(state.forward_verdict("vpc1", "eth0", any, any), None);
    }

    #[test]
    fn test_rules_need_chain() {
        let ctl = FakeControl::new();
        let rule = FilterRule::new(Chain::Forward, Target::Accept);
        assert!(!ctl.add_filter_rule(&rule, None).success);
        ctl.ensure_chain(Chain::Forward, None);
        assert!(ctl.add_filter_rule(&rule, None).success);
        assert!(ctl.add_filter_rule(&rule, None).success);
        assert_eq!(ctl.list_rules(Chain::Forward, None).unwrap().len(), 1);
    }
}
