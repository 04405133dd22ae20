//! Ordered external steps with compensation
//!
//! Each completed step may push its inverse. When a later step fails the
//! inverses run newest first. A failing inverse is logged and the unwind
//! carries on.

use crate::bulkhead::{Chain, FilterRule};
use crate::control::{Journal, NetworkControl, Outcome};
use crate::error::{Error, Result};
use ipnet::Ipv4Net;

/// Inverse of a completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    DeleteSwitch(String),
    DeleteNamespace(String),
    DeleteCable(String),
    DeleteMasquerade(Ipv4Net, String),
    DeleteFilterRule(FilterRule, Option<String>),
    /// Put back the rules a chain held before it was flushed
    RestoreChain(Chain, Option<String>, Vec<FilterRule>),
}

impl Undo {
    fn label(&self) -> String {
        match self {
            Undo::DeleteSwitch(name) => format!("undo: delete switch {}", name),
            Undo::DeleteNamespace(ns) => format!("undo: delete namespace {}", ns),
            Undo::DeleteCable(end) => format!("undo: delete cable {}", end),
            Undo::DeleteMasquerade(src, uplink) => {
                format!("undo: delete masquerade {} via {}", src, uplink)
            }
            Undo::DeleteFilterRule(rule, _) => format!("undo: delete rule {}", rule),
            Undo::RestoreChain(chain, _, rules) => {
                format!("undo: restore {} ({} rules)", chain, rules.len())
            }
        }
    }

    fn apply<C: NetworkControl>(&self, ctl: &C) -> Outcome {
        match self {
            Undo::DeleteSwitch(name) => ctl.delete_switch(name),
            Undo::DeleteNamespace(ns) => ctl.delete_namespace(ns),
            Undo::DeleteCable(end) => ctl.delete_cable(end),
            Undo::DeleteMasquerade(src, uplink) => ctl.delete_masquerade(*src, uplink),
            Undo::DeleteFilterRule(rule, ns) => ctl.delete_filter_rule(rule, ns.as_deref()),
            Undo::RestoreChain(chain, ns, rules) => {
                let ns = ns.as_deref();
                let flushed = ctl.flush_chain(*chain, ns);
                if !flushed.success {
                    return flushed;
                }
                for rule in rules {
                    let outcome = ctl.add_filter_rule(rule, ns);
                    if !outcome.success {
                        return outcome;
                    }
                }
                Outcome::ok("")
            }
        }
    }
}

/// Map a failed outcome to the error surfaced to the caller
pub fn outcome_error(step: &str, outcome: Outcome) -> Error {
    match outcome.timed_out_after {
        Some(seconds) => Error::Timeout {
            step: step.to_string(),
            seconds,
        },
        None => Error::ExternalOperationFailed {
            step: step.to_string(),
            output: outcome.output,
            status: outcome.status,
        },
    }
}

pub struct Transaction<'a, C: NetworkControl> {
    ctl: &'a C,
    vpc: String,
    undo: Vec<Undo>,
    journal: &'a mut Journal,
    /// Best-effort steps that failed
    missed: Vec<String>,
}

impl<'a, C: NetworkControl> Transaction<'a, C> {
    pub fn new(ctl: &'a C, vpc: &str, journal: &'a mut Journal) -> Self {
        Self {
            ctl,
            vpc: vpc.to_string(),
            undo: Vec::new(),
            journal,
            missed: Vec::new(),
        }
    }

    /// Run a required step; on success register its inverse
    pub fn step(
        &mut self,
        label: &str,
        op: impl FnOnce(&C) -> Outcome,
        undo: Option<Undo>,
    ) -> Result<()> {
        let outcome = op(self.ctl);
        self.journal.record(&self.vpc, label, &outcome);

        if outcome.success {
            tracing::debug!(vpc = %self.vpc, step = label, "step done");
            if let Some(undo) = undo {
                self.undo.push(undo);
            }
            Ok(())
        } else {
            Err(outcome_error(label, outcome))
        }
    }

    /// Run a read the following steps depend on; nothing to undo
    pub fn read<T>(
        &mut self,
        label: &str,
        op: impl FnOnce(&C) -> std::result::Result<T, Outcome>,
    ) -> Result<T> {
        match op(self.ctl) {
            Ok(value) => {
                self.journal.record(&self.vpc, label, &Outcome::ok(""));
                Ok(value)
            }
            Err(outcome) => {
                self.journal.record(&self.vpc, label, &outcome);
                Err(outcome_error(label, outcome))
            }
        }
    }

    /// Run a best-effort step; a failure is logged and remembered
    pub fn attempt(&mut self, label: &str, op: impl FnOnce(&C) -> Outcome) -> bool {
        let outcome = op(self.ctl);
        self.journal.record(&self.vpc, label, &outcome);

        if !outcome.success {
            tracing::warn!(vpc = %self.vpc, step = label, output = %outcome.output, "teardown step failed");
            self.missed.push(label.to_string());
        }
        outcome.success
    }

    pub fn missed(&self) -> &[String] {
        &self.missed
    }

    /// Close the transaction; on error unwind every registered inverse
    pub fn settle<T>(self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::warn!(vpc = %self.vpc, error = %e, "operation failed, rolling back");
            self.unwind();
        }
        result
    }

    fn unwind(self) {
        let Transaction {
            ctl,
            vpc,
            undo,
            journal,
            ..
        } = self;

        for inverse in undo.into_iter().rev() {
            let label = inverse.label();
            let outcome = inverse.apply(ctl);
            journal.record(&vpc, &label, &outcome);
            if !outcome.success {
                tracing::warn!(vpc = %vpc, step = %label, output = %outcome.output, "compensation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::{Protocol, Target};
    use crate::control::fake::FakeControl;

    #[test]
    fn test_unwind_runs_in_reverse() {
        let ctl = FakeControl::new();
        let mut journal = Journal::new();
        let mut tx = Transaction::new(&ctl, "prod", &mut journal);

        let result = (|| {
            tx.step(
                "create switch",
                |c| c.create_switch("vpc1"),
                Some(Undo::DeleteSwitch("vpc1".into())),
            )?;
            tx.step(
                "create namespace",
                |c| c.create_namespace("vpc-prod.a"),
                Some(Undo::DeleteNamespace("vpc-prod.a".into())),
            )?;
            tx.step("enable forwarding", |_| Outcome::failed("nope", Some(1)), None)
        })();

        let err = tx.settle(result).unwrap_err();
        assert_eq!(err.kind(), "ExternalOperationFailed");
        assert!(ctl.state().is_clean());

        let calls = ctl.calls();
        let ns_pos = calls.iter().position(|c| c.starts_with("delete_namespace")).unwrap();
        let sw_pos = calls.iter().position(|c| c.starts_with("delete_switch")).unwrap();
        assert!(ns_pos < sw_pos);

        assert_eq!(journal.failures().count(), 1);
    }

    #[test]
    fn test_timeout_maps_to_timeout_error() {
        let err = outcome_error("create switch", Outcome::timed_out(10));
        assert!(matches!(err, Error::Timeout { seconds: 10, .. }));
    }

    #[test]
    fn test_failed_compensation_does_not_stop_unwind() {
        let ctl = FakeControl::new();
        ctl.fail("delete_namespace");
        let mut journal = Journal::new();
        let mut tx = Transaction::new(&ctl, "prod", &mut journal);

        let result = (|| {
            tx.step(
                "create switch",
                |c| c.create_switch("vpc1"),
                Some(Undo::DeleteSwitch("vpc1".into())),
            )?;
            tx.step(
                "create namespace",
                |c| c.create_namespace("vpc-prod.a"),
                Some(Undo::DeleteNamespace("vpc-prod.a".into())),
            )?;
            tx.step("boom", |_| Outcome::failed("", Some(1)), None)
        })();
        assert!(tx.settle(result).is_err());

        // Namespace survived its failed undo, switch was still removed
        assert!(ctl.state().switches.is_empty());
        assert!(ctl.state().namespaces.contains("vpc-prod.a"));
    }

    #[test]
    fn test_restore_chain_puts_rules_back_in_order() {
        let ctl = FakeControl::new();
        ctl.create_namespace("vpc-prod.a");
        ctl.ensure_chain(Chain::Ingress, Some("vpc-prod.a"));
        let first = FilterRule::new(Chain::Ingress, Target::Drop).with_port(Protocol::Tcp, 22);
        let second = FilterRule::new(Chain::Ingress, Target::Accept).with_port(Protocol::Tcp, 80);
        ctl.add_filter_rule(&first, Some("vpc-prod.a"));
        ctl.add_filter_rule(&second, Some("vpc-prod.a"));
        let before = ctl.list_rules(Chain::Ingress, Some("vpc-prod.a")).unwrap();

        let mut journal = Journal::new();
        let mut tx = Transaction::new(&ctl, "prod", &mut journal);
        let result = (|| {
            let lines = tx.read("read chain", |c| c.list_rules(Chain::Ingress, Some("vpc-prod.a")))?;
            let rules = lines.iter().filter_map(|l| FilterRule::parse(l)).collect();
            tx.step(
                "flush chain",
                |c| c.flush_chain(Chain::Ingress, Some("vpc-prod.a")),
                Some(Undo::RestoreChain(Chain::Ingress, Some("vpc-prod.a".into()), rules)),
            )?;
            tx.step("boom", |_| Outcome::failed("", Some(1)), None)
        })();
        assert!(tx.settle(result).is_err());

        assert_eq!(ctl.list_rules(Chain::Ingress, Some("vpc-prod.a")).unwrap(), before);
        assert!(journal.entries().iter().any(|e| e.step == "undo: restore VPCCTL-INGRESS (2 rules)"));
    }

    #[test]
    fn test_attempt_collects_misses() {
        let ctl = FakeControl::new();
        ctl.fail("delete_switch");
        let mut journal = Journal::new();
        let mut tx = Transaction::new(&ctl, "prod", &mut journal);

        assert!(!tx.attempt("delete switch", |c| c.delete_switch("vpc1")));
        assert!(tx.attempt("delete namespace", |c| c.delete_namespace("x")));
        assert_eq!(tx.missed(), ["delete switch".to_string()]);
    }
}
