//! File-locked read-modify-write mutator for the ESDX router topology
//! document.

pub mod document;
pub mod lock;
pub mod mutator;

pub use document::{esdx_router_name, BorderRouter, Interface, TopologyDocument, Underlay};
pub use lock::{LockError, LockGuard};
pub use mutator::{
    default_local_interface, ContractActivation, ContractDeactivation, Topology, TopologyConfig,
    TopologyError,
};
