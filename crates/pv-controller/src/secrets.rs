//! SSH key secret provisioning
//!
//! Private keys referenced by the inventory live on the machine running the
//! reconciler. Each key is copied into a secret, mounted into the worker
//! pods, and the inventory entry is rewritten to point at the mounted file.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use pv_core::inventory::HostEntry;
use pv_core::types::SecretSpec;
use pv_core::Cluster;

use crate::reconcile::ReconcileError;
use crate::template;

/// Data key holding the private key inside the secret
pub const SECRET_KEY_NAME: &str = "sshkey";
/// Directory under which key secrets are mounted
pub const SECRET_MOUNT_ROOT: &str = "/secrets";

/// Name of the secret holding `host`'s key
pub fn secret_name(controller: &str, host: &str) -> String {
    format!("{}-{}", controller, host)
}

/// Directory where `host`'s key secret is mounted
pub fn mount_path(host: &str) -> String {
    format!("{}/{}", SECRET_MOUNT_ROOT, host)
}

/// Provision a secret per distinct private key and rewrite the entries.
///
/// Entries referencing the same key path share the first secret created for
/// it. Returns the number of secrets applied.
pub async fn provision_key_secrets(
    cluster: &dyn Cluster,
    controller: &str,
    labels: &BTreeMap<String, String>,
    entries: &mut [HostEntry],
    pod_template: &mut PodTemplateSpec,
) -> Result<usize, ReconcileError> {
    let mut mounted: HashMap<String, String> = HashMap::new();

    for entry in entries.iter_mut() {
        let Some(key_path) = entry.private_key.clone().filter(|p| !p.is_empty()) else {
            continue;
        };

        if let Some(mount) = mounted.get(&key_path) {
            entry.private_key = Some(format!("{}/{}", mount, SECRET_KEY_NAME));
            continue;
        }

        let data = tokio::fs::read(&key_path)
            .await
            .map_err(|source| ReconcileError::KeyFile {
                path: PathBuf::from(&key_path),
                source,
            })?;

        let name = secret_name(controller, &entry.name);
        let secret = SecretSpec {
            name: name.clone(),
            labels: labels.clone(),
            data: BTreeMap::from([(SECRET_KEY_NAME.to_string(), data)]),
        };
        cluster.apply_secret(&secret).await?;
        tracing::info!("Applied secret {} for host {}", name, entry.name);

        let mount = mount_path(&entry.name);
        let volume = format!("secret-{}", entry.name);
        template::set_secret_volume(pod_template, &volume, &name);
        template::set_volume_mount(template::first_container(pod_template), &volume, &mount);

        entry.private_key = Some(format!("{}/{}", mount, SECRET_KEY_NAME));
        mounted.insert(key_path, mount);
    }

    Ok(mounted.len())
}
