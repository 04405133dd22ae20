//! VPC records and lifecycle

pub mod descriptor;
pub mod state;

pub use descriptor::{
    CablePair, NatState, Peering, PolicyStamp, SubnetDescriptor, SubnetKind, VpcDescriptor,
    VpcState,
};
pub use state::VpcLifecycle;
