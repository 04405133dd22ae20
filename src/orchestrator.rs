//! VPC lifecycle orchestration
//!
//! Each operation validates first, then issues ordered network control calls
//! inside a [`Transaction`]. The descriptor is saved only after every step
//! succeeded; on failure the completed steps are unwound and the stored
//! descriptor is left as it was.

pub mod transaction;

pub use transaction::{Transaction, Undo};

use crate::bulkhead::{
    Chain, FilterRule, isolation_rules, nat_forward_rules, peering_forward_rules,
    private_egress_rules,
};
use crate::control::{Journal, NetworkControl};
use crate::error::{Error, Result, Violation};
use crate::network::naming::{validate_interface, validate_name};
use crate::network::{Names, overlaps, validate_subnet_create, validate_vpc_create};
use crate::policy::{self, PolicyDocument, RuleOp};
use crate::store::ConfigStore;
use crate::vpc::{
    CablePair, NatState, Peering, PolicyStamp, SubnetDescriptor, SubnetKind, VpcDescriptor,
    VpcLifecycle, VpcState,
};
use chrono::Utc;

pub struct Orchestrator<'a, C: NetworkControl> {
    ctl: &'a C,
    store: &'a ConfigStore,
    host_offset: u32,
    default_uplink: String,
    journal: Journal,
}

impl<'a, C: NetworkControl> Orchestrator<'a, C> {
    pub fn new(ctl: &'a C, store: &'a ConfigStore) -> Self {
        Self {
            ctl,
            store,
            host_offset: 0,
            default_uplink: "eth0".to_string(),
            journal: Journal::new(),
        }
    }

    /// Usable-host offset of each subnet's address
    pub fn with_host_offset(mut self, offset: u32) -> Self {
        self.host_offset = offset;
        self
    }

    pub fn with_default_uplink(mut self, uplink: impl Into<String>) -> Self {
        self.default_uplink = uplink.into();
        self
    }

    /// Persist the journal collected so far
    fn flush_journal(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        let failed = journal.failures().count();
        if failed > 0 {
            tracing::debug!(steps = journal.entries().len(), failed, "journal has failed steps");
        }
        if let Err(e) = self.store.append_journal(journal.entries()) {
            tracing::warn!(error = %e, "failed to write operation journal");
        }
    }

    fn journaled<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        self.flush_journal();
        result
    }

    /// Create a VPC with its switch and gateway address
    ///
    /// A CIDR the validator rejects surfaces as `InvalidConfig`; the
    /// message names the underlying violation.
    pub fn create_vpc(&mut self, name: &str, cidr: &str) -> Result<VpcDescriptor> {
        self.journaled(|this| this.run_create_vpc(name, cidr))
    }

    fn run_create_vpc(&mut self, name: &str, cidr: &str) -> Result<VpcDescriptor> {
        validate_name(name)?;
        let store = self.store;
        if store.exists(name) {
            return Err(Error::already_exists("VPC", name));
        }
        let plan = validate_vpc_create(cidr).map_err(Error::InvalidVpc)?;

        tracing::info!(vpc = name, cidr = %plan.network, gateway = %plan.gateway, "creating VPC");

        let mut lifecycle = VpcLifecycle::absent(name);
        let vpc = VpcDescriptor {
            name: name.to_string(),
            cidr: plan.network,
            gateway: plan.gateway,
            switch: Names::switch(name),
            state: VpcState::Created,
            nat: NatState::default(),
            subnets: Vec::new(),
            peerings: Vec::new(),
            created_at: Utc::now(),
        };

        let mut tx = Transaction::new(self.ctl, name, &mut self.journal);
        let result = build_switch(&mut tx, &vpc).and_then(|()| {
            lifecycle.provision()?;
            store.save(&vpc)
        });
        tx.settle(result)?;

        tracing::info!(vpc = name, switch = %vpc.switch, "VPC created");
        Ok(vpc)
    }

    /// Add a subnet with its namespace, cable pair and default route
    pub fn add_subnet(
        &mut self,
        vpc_name: &str,
        subnet_name: &str,
        cidr: &str,
        kind: SubnetKind,
    ) -> Result<SubnetDescriptor> {
        self.journaled(|this| this.run_add_subnet(vpc_name, subnet_name, cidr, kind))
    }

    fn run_add_subnet(
        &mut self,
        vpc_name: &str,
        subnet_name: &str,
        cidr: &str,
        kind: SubnetKind,
    ) -> Result<SubnetDescriptor> {
        validate_name(subnet_name)?;
        let store = self.store;
        let mut vpc = store.load(vpc_name)?;
        if vpc.subnet(subnet_name).is_some() {
            return Err(Error::already_exists(
                "subnet",
                format!("{}/{}", vpc_name, subnet_name),
            ));
        }

        let plan = validate_subnet_create(
            &vpc.cidr,
            vpc.gateway,
            cidr,
            vpc.sibling_networks(),
            self.host_offset,
        )
        .map_err(Error::Rejected)?;

        let prior = vpc.state;
        let mut lifecycle = VpcLifecycle::resume(&vpc.name, prior)?;
        lifecycle.extend()?;

        let (host_end, namespace_end) = Names::cable(&vpc.name, subnet_name);
        let subnet = SubnetDescriptor {
            name: subnet_name.to_string(),
            cidr: plan.network,
            kind,
            address: plan.address,
            namespace_id: Names::namespace(&vpc.name, subnet_name),
            cable: CablePair {
                host_end,
                namespace_end,
            },
            workload: None,
            policy: None,
        };

        tracing::info!(
            vpc = vpc_name,
            subnet = subnet_name,
            cidr = %subnet.cidr,
            address = %subnet.address,
            kind = %kind,
            "adding subnet"
        );

        let mut tx = Transaction::new(self.ctl, vpc_name, &mut self.journal);
        let result = wire_subnet(&mut tx, &vpc, &subnet).and_then(|()| {
            vpc.subnets.push(subnet.clone());
            lifecycle.settle()?;
            vpc.state = lifecycle.settled().unwrap_or(VpcState::Ready);
            store.save(&vpc)
        });

        if result.is_err()
            && lifecycle.settled().is_none()
            && let Err(e) = lifecycle.roll_back(prior)
        {
            tracing::warn!(vpc = vpc_name, error = %e, "lifecycle roll back failed");
        }
        tx.settle(result)?;

        Ok(subnet)
    }

    /// Enable NAT for a VPC through an uplink interface
    ///
    /// A no-op when NAT is already enabled through the same uplink. Switching
    /// uplinks installs the new rules and records the new uplink before the
    /// old rules are removed; a failure while removing them leaves stale
    /// rules behind but never a descriptor that disagrees with the host.
    pub fn enable_nat(&mut self, vpc_name: &str, uplink: Option<&str>) -> Result<VpcDescriptor> {
        self.journaled(|this| this.run_enable_nat(vpc_name, uplink))
    }

    fn run_enable_nat(&mut self, vpc_name: &str, uplink: Option<&str>) -> Result<VpcDescriptor> {
        let uplink = uplink.unwrap_or(&self.default_uplink).to_string();
        validate_interface(&uplink)?;

        let store = self.store;
        let mut vpc = store.load(vpc_name)?;
        if vpc.nat.active_uplink() == Some(uplink.as_str()) {
            tracing::info!(vpc = vpc_name, uplink = %uplink, "NAT already enabled");
            return Ok(vpc);
        }
        let previous = vpc.nat.active_uplink().map(str::to_string);

        tracing::info!(vpc = vpc_name, uplink = %uplink, "enabling NAT");

        let mut tx = Transaction::new(self.ctl, vpc_name, &mut self.journal);
        let result = install_nat(&mut tx, &vpc, &uplink).and_then(|()| {
            vpc.nat = NatState {
                enabled: true,
                uplink: Some(uplink.clone()),
            };
            store.save(&vpc)
        });
        tx.settle(result)?;

        if let Some(old) = &previous {
            let mut tx = Transaction::new(self.ctl, vpc_name, &mut self.journal);
            remove_nat(&mut tx, &vpc, old);
            if !tx.missed().is_empty() {
                tracing::warn!(vpc = vpc_name, uplink = %old, "stale NAT rules left on previous uplink");
            }
        }

        Ok(vpc)
    }

    /// Apply an ingress policy to the subnet it names
    pub fn apply_policy(&mut self, vpc_name: &str, doc: &PolicyDocument) -> Result<PolicyStamp> {
        self.journaled(|this| this.run_apply_policy(vpc_name, doc))
    }

    fn run_apply_policy(&mut self, vpc_name: &str, doc: &PolicyDocument) -> Result<PolicyStamp> {
        let store = self.store;
        let mut vpc = store.load(vpc_name)?;
        let compiled = policy::compile(doc)?;

        let subnet = vpc
            .subnet_by_cidr(&compiled.subnet)
            .ok_or_else(|| Error::UnknownSubnet {
                vpc: vpc_name.to_string(),
                cidr: compiled.subnet.to_string(),
            })?;
        let subnet_name = subnet.name.clone();
        let namespace = subnet.namespace_id.clone();

        tracing::info!(
            vpc = vpc_name,
            subnet = %subnet_name,
            rules = compiled.rule_count(),
            "applying policy"
        );

        let mut tx = Transaction::new(self.ctl, vpc_name, &mut self.journal);
        let result = apply_rule_ops(&mut tx, &compiled.ops, &namespace).and_then(|()| {
            let stamp = PolicyStamp {
                rules: compiled.rule_count(),
                applied_at: Utc::now(),
            };
            if let Some(subnet) = vpc.subnet_mut(&subnet_name) {
                subnet.policy = Some(stamp.clone());
            }
            store.save(&vpc)?;
            Ok(stamp)
        });
        tx.settle(result)
    }

    /// Connect the switches of two VPCs
    pub fn peer(&mut self, a: &str, b: &str) -> Result<()> {
        self.journaled(|this| this.run_peer(a, b))
    }

    fn run_peer(&mut self, a: &str, b: &str) -> Result<()> {
        validate_name(a)?;
        validate_name(b)?;
        if a == b {
            return Err(Error::InvalidName {
                name: b.to_string(),
                reason: "a VPC cannot be peered with itself".to_string(),
            });
        }

        let store = self.store;
        let mut va = store.load(a)?;
        let mut vb = store.load(b)?;
        if va.peering(b).is_some() {
            return Err(Error::already_exists("peering", format!("{} <-> {}", a, b)));
        }
        if overlaps(&va.cidr, &vb.cidr) {
            return Err(Violation::Overlap {
                candidate: vb.cidr,
                sibling: a.to_string(),
                existing: va.cidr,
            }
            .into());
        }

        let link_a = Names::peer_link(a, b);
        let link_b = Names::peer_link(b, a);
        tracing::info!(a, b, link_a = %link_a, link_b = %link_b, "peering VPCs");

        let original_a = va.clone();
        let mut tx = Transaction::new(self.ctl, a, &mut self.journal);
        let result = connect_peers(&mut tx, &va, &vb, &link_a, &link_b).and_then(|()| {
            va.peerings.push(Peering {
                peer: b.to_string(),
                peer_cidr: vb.cidr,
                local_link: link_a.clone(),
                remote_link: link_b.clone(),
            });
            vb.peerings.push(Peering {
                peer: a.to_string(),
                peer_cidr: va.cidr,
                local_link: link_b.clone(),
                remote_link: link_a.clone(),
            });
            store.save(&va)?;
            store.save(&vb).inspect_err(|_| {
                if let Err(e) = store.save(&original_a) {
                    tracing::warn!(vpc = a, error = %e, "failed to restore descriptor");
                }
            })
        });
        tx.settle(result)
    }

    /// Tear down a VPC and everything it owns
    ///
    /// Returns whether a descriptor existed. Teardown steps are best-effort;
    /// if any of them fails the descriptor is kept so a retry can finish.
    pub fn delete_vpc(&mut self, name: &str) -> Result<bool> {
        self.journaled(|this| this.run_delete_vpc(name))
    }

    fn run_delete_vpc(&mut self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let store = self.store;

        let Some(vpc) = store.try_load(name)? else {
            remove_strays(self.ctl, name, &mut self.journal);
            return Ok(false);
        };

        let mut lifecycle = VpcLifecycle::resume(&vpc.name, vpc.state)?;
        lifecycle.teardown()?;
        tracing::info!(vpc = name, subnets = vpc.subnets.len(), "deleting VPC");

        let mut tx = Transaction::new(self.ctl, name, &mut self.journal);
        for subnet in &vpc.subnets {
            tx.attempt("delete cable pair", |c| c.delete_cable(&subnet.cable.host_end));
            tx.attempt("delete namespace", |c| c.delete_namespace(&subnet.namespace_id));
        }
        tx.attempt("delete switch", |c| c.delete_switch(&vpc.switch));
        for rule in isolation_rules(&vpc.switch) {
            tx.attempt("delete isolation rule", |c| c.delete_filter_rule(&rule, None));
        }
        if let Some(uplink) = vpc.nat.active_uplink() {
            remove_nat(&mut tx, &vpc, uplink);
        }
        for peering in &vpc.peerings {
            tx.attempt("delete peering link", |c| c.delete_cable(&peering.local_link));
            for rule in peering_forward_rules(vpc.cidr, peering.peer_cidr) {
                tx.attempt("delete peering rule", |c| c.delete_filter_rule(&rule, None));
            }
        }
        let missed = tx.missed().to_vec();

        for peering in &vpc.peerings {
            forget_peering(store, &peering.peer, name);
        }

        if !missed.is_empty() {
            return Err(Error::ExternalOperationFailed {
                step: "delete VPC".to_string(),
                output: format!(
                    "teardown incomplete ({}); descriptor kept for retry",
                    missed.join(", ")
                ),
                status: None,
            });
        }

        store.delete(name)?;
        lifecycle.vanish()?;
        tracing::info!(vpc = name, "VPC deleted");
        Ok(true)
    }
}

fn build_switch<C: NetworkControl>(tx: &mut Transaction<'_, C>, vpc: &VpcDescriptor) -> Result<()> {
    let switch = vpc.switch.as_str();
    tx.step(
        "create switch",
        |c| c.create_switch(switch),
        Some(Undo::DeleteSwitch(switch.to_string())),
    )?;
    tx.step(
        "assign gateway address",
        |c| c.assign_address(switch, vpc.gateway, vpc.cidr.prefix_len(), None),
        None,
    )?;
    tx.step("bring up switch", |c| c.set_up(switch, None), None)?;
    tx.step(
        "ensure forward chain",
        |c| c.ensure_chain(Chain::Forward, None),
        None,
    )?;
    for rule in isolation_rules(switch) {
        let undo = Undo::DeleteFilterRule(rule.clone(), None);
        tx.step(
            "install isolation rule",
            |c| c.add_filter_rule(&rule, None),
            Some(undo),
        )?;
    }
    Ok(())
}

/// Steps whose effect lives inside the namespace need no inverse: deleting
/// the namespace takes them along.
fn wire_subnet<C: NetworkControl>(
    tx: &mut Transaction<'_, C>,
    vpc: &VpcDescriptor,
    subnet: &SubnetDescriptor,
) -> Result<()> {
    let ns = subnet.namespace_id.as_str();
    let host_end = subnet.cable.host_end.as_str();
    let ns_end = subnet.cable.namespace_end.as_str();

    tx.step(
        "create namespace",
        |c| c.create_namespace(ns),
        Some(Undo::DeleteNamespace(ns.to_string())),
    )?;
    tx.step(
        "create cable pair",
        |c| c.create_cable(host_end, ns_end),
        Some(Undo::DeleteCable(host_end.to_string())),
    )?;
    tx.step(
        "attach cable to switch",
        |c| c.attach_to_switch(host_end, &vpc.switch),
        None,
    )?;
    tx.step("bring up switch-side cable", |c| c.set_up(host_end, None), None)?;
    tx.step(
        "move cable into namespace",
        |c| c.move_to_namespace(ns_end, ns),
        None,
    )?;
    tx.step(
        "assign subnet address",
        |c| c.assign_address(ns_end, subnet.address, subnet.cidr.prefix_len(), Some(ns)),
        None,
    )?;
    tx.step("bring up loopback", |c| c.set_up("lo", Some(ns)), None)?;
    tx.step("bring up subnet interface", |c| c.set_up(ns_end, Some(ns)), None)?;
    tx.step(
        "install default route",
        |c| c.add_default_route(ns, vpc.gateway, ns_end),
        None,
    )?;

    if subnet.kind == SubnetKind::Private {
        tx.step(
            "ensure egress chain",
            |c| c.ensure_chain(Chain::Egress, Some(ns)),
            None,
        )?;
        for rule in private_egress_rules(vpc.cidr) {
            tx.step(
                "install egress rule",
                |c| c.add_filter_rule(&rule, Some(ns)),
                None,
            )?;
        }
    }

    Ok(())
}

fn install_nat<C: NetworkControl>(
    tx: &mut Transaction<'_, C>,
    vpc: &VpcDescriptor,
    uplink: &str,
) -> Result<()> {
    tx.step(
        "install masquerade",
        |c| c.add_masquerade(vpc.cidr, uplink),
        Some(Undo::DeleteMasquerade(vpc.cidr, uplink.to_string())),
    )?;
    tx.step(
        "ensure forward chain",
        |c| c.ensure_chain(Chain::Forward, None),
        None,
    )?;
    for rule in nat_forward_rules(&vpc.switch, uplink) {
        let undo = Undo::DeleteFilterRule(rule.clone(), None);
        tx.step(
            "install forward rule",
            |c| c.add_filter_rule(&rule, None),
            Some(undo),
        )?;
    }
    tx.step("enable forwarding", |c| c.enable_forwarding(), None)
}

fn remove_nat<C: NetworkControl>(tx: &mut Transaction<'_, C>, vpc: &VpcDescriptor, uplink: &str) {
    tx.attempt("remove masquerade", |c| c.delete_masquerade(vpc.cidr, uplink));
    for rule in nat_forward_rules(&vpc.switch, uplink) {
        tx.attempt("remove forward rule", |c| c.delete_filter_rule(&rule, None));
    }
}

fn apply_rule_ops<C: NetworkControl>(
    tx: &mut Transaction<'_, C>,
    ops: &[RuleOp],
    ns: &str,
) -> Result<()> {
    for op in ops {
        match op {
            RuleOp::EnsureChain(chain) => tx.step(
                &format!("ensure chain {}", chain),
                |c| c.ensure_chain(*chain, Some(ns)),
                None,
            )?,
            RuleOp::Flush(chain) => {
                let lines = tx.read(&format!("read chain {}", chain), |c| {
                    c.list_rules(*chain, Some(ns))
                })?;
                let previous = restorable_rules(&lines);
                tx.step(
                    &format!("flush chain {}", chain),
                    |c| c.flush_chain(*chain, Some(ns)),
                    Some(Undo::RestoreChain(*chain, Some(ns.to_string()), previous)),
                )?
            }
            RuleOp::Append(rule) => tx.step(
                "append ingress rule",
                |c| c.add_filter_rule(rule, Some(ns)),
                None,
            )?,
        }
    }
    Ok(())
}

/// Rules a flushed chain held, for putting back on failure
fn restorable_rules(lines: &[String]) -> Vec<FilterRule> {
    lines
        .iter()
        .filter_map(|line| {
            let rule = FilterRule::parse(line);
            if rule.is_none() {
                tracing::warn!(rule = %line, "unrecognised rule will not be restored");
            }
            rule
        })
        .collect()
}

/// Peering accepts go in at the head of the forward chain, ahead of the
/// isolation drops installed with each switch.
fn connect_peers<C: NetworkControl>(
    tx: &mut Transaction<'_, C>,
    a: &VpcDescriptor,
    b: &VpcDescriptor,
    link_a: &str,
    link_b: &str,
) -> Result<()> {
    tx.step(
        "create peering link",
        |c| c.create_cable(link_a, link_b),
        Some(Undo::DeleteCable(link_a.to_string())),
    )?;
    tx.step(
        "attach peering link",
        |c| c.attach_to_switch(link_a, &a.switch),
        None,
    )?;
    tx.step(
        "attach peering link",
        |c| c.attach_to_switch(link_b, &b.switch),
        None,
    )?;
    tx.step("bring up peering link", |c| c.set_up(link_a, None), None)?;
    tx.step("bring up peering link", |c| c.set_up(link_b, None), None)?;
    tx.step(
        "ensure forward chain",
        |c| c.ensure_chain(Chain::Forward, None),
        None,
    )?;
    for rule in peering_forward_rules(a.cidr, b.cidr) {
        let undo = Undo::DeleteFilterRule(rule.clone(), None);
        tx.step(
            "install peering rule",
            |c| c.insert_filter_rule(&rule, None),
            Some(undo),
        )?;
    }
    tx.step("enable forwarding", |c| c.enable_forwarding(), None)
}

/// Remove host resources that carry a VPC's derived names but no descriptor
fn remove_strays<C: NetworkControl>(ctl: &C, name: &str, journal: &mut Journal) {
    let mut tx = Transaction::new(ctl, name, journal);
    let switch = Names::switch(name);
    tx.attempt("delete stray switch", |c| c.delete_switch(&switch));
    for rule in isolation_rules(&switch) {
        tx.attempt("delete stray isolation rule", |c| c.delete_filter_rule(&rule, None));
    }

    let prefix = Names::namespace_prefix(name);
    match ctl.list_namespaces() {
        Ok(namespaces) => {
            for ns in namespaces.iter().filter(|ns| ns.starts_with(&prefix)) {
                tx.attempt("delete stray namespace", |c| c.delete_namespace(ns));
            }
        }
        Err(outcome) => {
            tracing::warn!(vpc = name, output = %outcome.output, "could not list namespaces");
        }
    }
}

/// Drop the record of a peering from the peer's descriptor
fn forget_peering(store: &ConfigStore, peer: &str, gone: &str) {
    match store.try_load(peer) {
        Ok(Some(mut vpc)) => {
            vpc.peerings.retain(|p| p.peer != gone);
            if let Err(e) = store.save(&vpc) {
                tracing::warn!(vpc = peer, error = %e, "failed to update peer descriptor");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(vpc = peer, error = %e, "failed to load peer descriptor"),
    }
}
