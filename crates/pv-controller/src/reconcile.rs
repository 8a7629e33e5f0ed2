//! Controller reconciliation
//!
//! Publishes an inventory into the controller record: the desired template
//! and replica count, one key secret per host and the snapshot annotation.
//! Pods holding claims on hosts that left the inventory are deleted so the
//! controller can replace them.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use pv_core::error::ClusterError;
use pv_core::inventory::{find_by_name, serialize, HostEntry};
use pv_core::manifest::ControllerManifest;
use pv_core::types::pod_is_alive;
use pv_core::{Cluster, ControllerRecord};

use crate::secrets;
use crate::template;

/// Reconciliation failures
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The record changed between read and write
    #[error("Controller {controller} was modified concurrently")]
    Conflict { controller: String },

    /// The manifest's container defines no command to run
    #[error("No value defined for PV_COMMAND in the manifest of controller {controller}")]
    MissingCommand { controller: String },

    /// A private key referenced by the inventory could not be read
    #[error("Failed to read private key {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pod template is not a valid pod template document
    #[error("Invalid pod template: {0}")]
    Template(#[from] serde_json::Error),

    /// Any other cluster API failure
    #[error(transparent)]
    Cluster(ClusterError),
}

impl ReconcileError {
    /// True if running the reconciliation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Conflict { .. })
    }
}

impl From<ClusterError> for ReconcileError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Conflict { name, .. } => ReconcileError::Conflict { controller: name },
            other => ReconcileError::Cluster(other),
        }
    }
}

/// Applies manifests and inventories to the cluster
pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Create or update the controller described by `manifest`.
    ///
    /// `replicas_override` wins over the stored replica count, which wins
    /// over the manifest's.
    pub async fn reconcile(
        &self,
        hosts_group: &str,
        mut inventory: Vec<HostEntry>,
        manifest: &ControllerManifest,
        replicas_override: Option<i32>,
    ) -> Result<ControllerRecord, ReconcileError> {
        let name = manifest.name.as_str();

        let mut pod_template = template::decode(&manifest.template)?;
        template::apply_worker_defaults(&mut pod_template, hosts_group, name);
        if !template::has_command(template::first_container(&mut pod_template)) {
            return Err(ReconcileError::MissingCommand {
                controller: name.to_string(),
            });
        }

        let existing = self.cluster.get_controller(name).await?;
        let is_update = existing.is_some();
        let mut record = existing.unwrap_or_else(|| {
            let mut record = ControllerRecord::new(name);
            record.namespace = Some(self.cluster.namespace().to_string());
            record
        });
        let pods = self.cluster.list_pods().await?;

        record.replicas = replicas_override
            .or(record.replicas)
            .or(manifest.replicas);
        record
            .labels
            .extend(manifest.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !manifest.selector.is_empty() {
            record.selector = manifest.selector.clone();
        }

        let provisioned = secrets::provision_key_secrets(
            self.cluster.as_ref(),
            name,
            &record.labels,
            &mut inventory,
            &mut pod_template,
        )
        .await?;
        record.template = template::encode(&pod_template)?;
        record.set_inventory_text(serialize(&inventory));

        tracing::info!(
            "Reconciling controller {} version {:?} with {} hosts, {} key secrets and replicas {:?}",
            name,
            record.resource_version,
            inventory.len(),
            provisioned,
            record.replicas
        );

        for (host, owner) in record.claims() {
            if find_by_name(&inventory, &host).is_some() {
                continue;
            }
            if pod_is_alive(&pods, &owner) {
                tracing::info!(
                    "Deleting pod {} as there is no longer an inventory host called {}",
                    owner,
                    host
                );
                if let Err(e) = self.cluster.delete_pod(&owner).await {
                    tracing::warn!("Failed to delete pod {}: {}", owner, e);
                }
            }
            record.remove_claim(&host);
        }

        let stored = if is_update {
            self.cluster.replace_controller(&record).await
        } else {
            self.cluster.create_controller(&record).await
        };
        stored.map_err(|e| {
            tracing::info!("Failed to write controller {}: {}", name, e);
            ReconcileError::from(e)
        })
    }
}
