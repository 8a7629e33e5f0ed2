//! pv-controller: Host leasing and controller reconciliation
//!
//! Worker pods use the [`LeaseCoordinator`] to claim exclusive ownership of
//! one inventory host through annotations on the shared controller record.
//! The [`Reconciler`] publishes the inventory and desired pod template into
//! that record. [`KubeCluster`] backs both with the Kubernetes API.

pub mod backoff;
pub mod kube;
pub mod lease;
pub mod reconcile;
pub mod secrets;
pub mod template;

pub use self::kube::KubeCluster;
pub use backoff::RandomBackoff;
pub use lease::{Lease, LeaseConfig, LeaseCoordinator, LeaseError};
pub use reconcile::{ReconcileError, Reconciler};
