//! Rc command: publish an inventory group onto the replication controller

use std::path::PathBuf;

use anyhow::{Context, Result};

use pv_controller::Reconciler;
use pv_core::inventory::load_from_inventory_file;
use pv_core::manifest::{load_group_variables, load_manifest};

use super::support::connect_cluster;

/// Arguments of `podvisor rc`
#[derive(Debug, Clone)]
pub struct RcArgs {
    /// Inventory group
    pub hosts: String,
    /// Inventory file
    pub inventory: PathBuf,
    /// Controller manifest, defaults to `kubernetes/<hosts>/rc.yml`
    pub manifest: Option<PathBuf>,
    /// Directory holding `group_vars/`
    pub playbook_dir: PathBuf,
    /// Desired replicas; negative keeps the stored count
    pub replicas: i32,
    /// Namespace override
    pub namespace: Option<String>,
}

impl RcArgs {
    /// Manifest path after defaulting
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest.clone().unwrap_or_else(|| {
            self.playbook_dir
                .join("kubernetes")
                .join(&self.hosts)
                .join("rc.yml")
        })
    }
}

/// `-1` (or any negative count) means "not specified"
pub fn replicas_override(replicas: i32) -> Option<i32> {
    (replicas >= 0).then_some(replicas)
}

/// Create or update the controller for `args.hosts`
pub async fn rc_command(args: RcArgs) -> Result<i32> {
    let entries = load_from_inventory_file(&args.inventory, &args.hosts)
        .context("Cannot load host entries")?;
    tracing::info!(
        "Found {} host entries in the inventory for {}",
        entries.len(),
        args.hosts
    );

    let vars = load_group_variables(&args.playbook_dir, &args.hosts)?;
    let manifest_path = args.manifest_path();
    let manifest = load_manifest(&manifest_path, &vars)
        .with_context(|| format!("Failed to load manifest {}", manifest_path.display()))?;

    let cluster = connect_cluster(args.namespace.clone()).await?;
    let record = Reconciler::new(cluster)
        .reconcile(&args.hosts, entries, &manifest, replicas_override(args.replicas))
        .await
        .with_context(|| format!("Failed to update controller {}", manifest.name))?;

    tracing::info!(
        "Controller {} has {} replicas and {} claimed hosts",
        record.name,
        record.replicas.unwrap_or(0),
        record.claims().len()
    );
    println!("{}", record.name);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_override() {
        assert_eq!(replicas_override(-1), None);
        assert_eq!(replicas_override(0), Some(0));
        assert_eq!(replicas_override(3), Some(3));
    }

    #[test]
    fn test_default_manifest_path() {
        let args = RcArgs {
            hosts: "appservers".to_string(),
            inventory: PathBuf::from("inventory"),
            manifest: None,
            playbook_dir: PathBuf::from("."),
            replicas: -1,
            namespace: None,
        };
        assert_eq!(
            args.manifest_path(),
            PathBuf::from("./kubernetes/appservers/rc.yml")
        );
    }
}
