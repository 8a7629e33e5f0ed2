//! pv-core: Core model and abstractions for podvisor
//!
//! This crate provides the inventory model, the controller record that
//! carries lease state, the cluster abstraction used by the controller and
//! agent crates, and shared configuration.

pub mod config;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod manifest;
pub mod memory;
pub mod traits;
pub mod types;

pub use inventory::{HostEntry, Transport};
pub use memory::InMemoryCluster;
pub use traits::Cluster;
pub use types::{ControllerRecord, PodInfo, PodPhase};
