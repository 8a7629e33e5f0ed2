//! Core trait definitions

mod cluster;

pub use cluster::Cluster;
