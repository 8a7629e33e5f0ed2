//! Cluster API abstraction

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::ClusterError;
use crate::types::{ControllerRecord, PodInfo, SecretSpec};

/// The orchestrator API as seen by podvisor.
///
/// All operations are scoped to one namespace. Writes of a controller record
/// carry the `resource_version` it was read with; a backend must reject the
/// write with [`ClusterError::Conflict`] when the stored version differs.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Namespace the client is bound to
    fn namespace(&self) -> &str;

    /// Fetch a controller record; `Ok(None)` when it does not exist
    async fn get_controller(&self, name: &str) -> Result<Option<ControllerRecord>, ClusterError>;

    /// Create a record that does not exist yet
    async fn create_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError>;

    /// Replace a record, guarded by its `resource_version`
    async fn replace_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError>;

    /// List the pods of the namespace
    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError>;

    /// Fetch one pod; `Ok(None)` when it does not exist
    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>, ClusterError>;

    /// Merge `annotations` into the pod's annotations
    async fn annotate_pod(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Delete a pod
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// Create the secret, or update it if it exists
    async fn apply_secret(&self, secret: &SecretSpec) -> Result<(), ClusterError>;
}
