//! VPC lifecycle state machine
//!
//! Uses the dynamic dispatch mode of the state-machines crate so the
//! orchestrator can drive transitions from a persisted starting point.

use super::descriptor::VpcState;
use crate::error::Error;
use state_machines::state_machine;

state_machine! {
    name: VpcMachine,
    dynamic: true,
    initial: Absent,
    states: [Absent, Created, SubnetsPartial, Ready, Deleting],
    events {
        provision {
            transition: { from: Absent, to: Created }
        }
        extend {
            transition: { from: [Created, Ready], to: SubnetsPartial }
        }
        settle {
            transition: { from: SubnetsPartial, to: Ready }
        }
        revert {
            transition: { from: SubnetsPartial, to: Created }
        }
        retract {
            transition: { from: SubnetsPartial, to: Ready }
        }
        teardown {
            transition: { from: [Created, SubnetsPartial, Ready], to: Deleting }
        }
        vanish {
            transition: { from: Deleting, to: Absent }
        }
    }
}

/// Lifecycle of one VPC for the duration of a command
pub struct VpcLifecycle {
    name: String,
    machine: DynamicVpcMachine<()>,
}

impl VpcLifecycle {
    /// Lifecycle of a VPC that does not exist yet
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            machine: VpcMachine::new(()).into_dynamic(),
        }
    }

    /// Lifecycle resumed from a persisted state
    pub fn resume(name: &str, state: VpcState) -> crate::error::Result<Self> {
        let mut lifecycle = Self::absent(name);
        lifecycle.fire("provision", VpcMachineEvent::Provision)?;
        if state == VpcState::Ready {
            lifecycle.fire("extend", VpcMachineEvent::Extend)?;
            lifecycle.fire("settle", VpcMachineEvent::Settle)?;
        }
        Ok(lifecycle)
    }

    pub fn current(&self) -> &str {
        self.machine.current_state()
    }

    /// Settled state to persist, if the machine is at rest
    pub fn settled(&self) -> Option<VpcState> {
        match self.current() {
            "Created" => Some(VpcState::Created),
            "Ready" => Some(VpcState::Ready),
            _ => None,
        }
    }

    fn fire(&mut self, label: &'static str, event: VpcMachineEvent) -> crate::error::Result<()> {
        let from = self.current().to_string();
        self.machine
            .handle(event)
            .map_err(|_| Error::InvalidTransition {
                vpc: self.name.clone(),
                event: label,
                state: from.clone(),
            })?;
        tracing::debug!(vpc = %self.name, event = label, from = %from, to = %self.current(), "lifecycle");
        Ok(())
    }

    pub fn provision(&mut self) -> crate::error::Result<()> {
        self.fire("provision", VpcMachineEvent::Provision)
    }

    /// A subnet is being added
    pub fn extend(&mut self) -> crate::error::Result<()> {
        self.fire("extend", VpcMachineEvent::Extend)
    }

    /// The subnet being added is in place
    pub fn settle(&mut self) -> crate::error::Result<()> {
        self.fire("settle", VpcMachineEvent::Settle)
    }

    /// The subnet being added was rolled back; return to the prior state
    pub fn roll_back(&mut self, prior: VpcState) -> crate::error::Result<()> {
        match prior {
            VpcState::Created => self.fire("revert", VpcMachineEvent::Revert),
            VpcState::Ready => self.fire("retract", VpcMachineEvent::Retract),
        }
    }

    pub fn teardown(&mut self) -> crate::error::Result<()> {
        self.fire("teardown", VpcMachineEvent::Teardown)
    }

    pub fn vanish(&mut self) -> crate::error::Result<()> {
        self.fire("vanish", VpcMachineEvent::Vanish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = VpcMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Absent");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut vpc = VpcLifecycle::absent("prod");
        vpc.provision().unwrap();
        assert_eq!(vpc.settled(), Some(VpcState::Created));

        vpc.extend().unwrap();
        assert_eq!(vpc.current(), "SubnetsPartial");
        assert_eq!(vpc.settled(), None);

        vpc.settle().unwrap();
        assert_eq!(vpc.settled(), Some(VpcState::Ready));

        vpc.teardown().unwrap();
        assert_eq!(vpc.current(), "Deleting");
        vpc.vanish().unwrap();
        assert_eq!(vpc.current(), "Absent");
    }

    #[test]
    fn test_resume_and_roll_back() {
        let mut vpc = VpcLifecycle::resume("prod", VpcState::Ready).unwrap();
        assert_eq!(vpc.current(), "Ready");
        vpc.extend().unwrap();
        vpc.roll_back(VpcState::Ready).unwrap();
        assert_eq!(vpc.current(), "Ready");

        let mut vpc = VpcLifecycle::resume("dev", VpcState::Created).unwrap();
        vpc.extend().unwrap();
        vpc.roll_back(VpcState::Created).unwrap();
        assert_eq!(vpc.current(), "Created");
    }

    #[test]
    fn test_invalid_transition() {
        let mut vpc = VpcLifecycle::absent("prod");
        let err = vpc.settle().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { event: "settle", ref state, .. } if state == "Absent"
        ));
    }
}
