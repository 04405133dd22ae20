//! Address management for VPC networks
//!
//! Provides:
//! - Typed CIDR parsing and gateway/host address derivation
//! - Containment and overlap checks
//! - Aggregated validation of create requests
//! - Deterministic host interface and namespace naming

pub mod cidr;
pub mod naming;
pub mod validate;

pub use cidr::{overlaps, parse_network};
pub use naming::Names;
pub use validate::{validate_subnet_create, validate_vpc_create};
