//! Kill command: pre-stop hook closing the pod's WinRM shell

use anyhow::{anyhow, Context, Result};

use pv_agent::session::{close_session, ControllerSessionStore, SessionStore};
use pv_agent::RemoteTarget;
use pv_core::config::SupervisorConfig;
use pv_core::identity::pod_identity;
use pv_core::inventory::{find_by_name, parse_snapshot};
use pv_core::types::HOST_NAME_ANNOTATION;

use super::support::connect_cluster;

/// Close the remote shell still recorded for this pod's host, if any
pub async fn kill_command(
    rc: &str,
    namespace: Option<String>,
    password: Option<&str>,
    config: &SupervisorConfig,
) -> Result<i32> {
    let self_pod = pod_identity().context("Couldn't get pod name")?;
    let cluster = connect_cluster(namespace).await?;

    let pod = cluster
        .get_pod(&self_pod)
        .await?
        .ok_or_else(|| anyhow!("Pod {} not found", self_pod))?;
    let Some(host_name) = pod.annotations.get(HOST_NAME_ANNOTATION) else {
        tracing::info!(
            "No annotation `{}` available on pod {}",
            HOST_NAME_ANNOTATION,
            self_pod
        );
        return Ok(0);
    };

    let record = cluster
        .get_controller(rc)
        .await?
        .ok_or_else(|| anyhow!("No ReplicationController found for name {}", rc))?;
    let Some(session_id) = record.session_id(host_name) else {
        tracing::info!("No shell recorded for host {}", host_name);
        return Ok(0);
    };

    let inventory = record.inventory_text().ok_or_else(|| {
        anyhow!(
            "Could not find the host inventory annotation on ReplicationController {}",
            rc
        )
    })?;
    let entries = parse_snapshot(inventory);
    tracing::debug!("Found {} host entries", entries.len());
    let entry = find_by_name(&entries, host_name).ok_or_else(|| {
        anyhow!(
            "Could not find a host entry called `{}` from {} host entries",
            host_name,
            entries.len()
        )
    })?;

    let target = RemoteTarget::from_entry(entry, password, config.default_port(entry.transport))?;
    close_session(&target, session_id)
        .await
        .with_context(|| format!("Failed to close shell {} on {}", session_id, host_name))?;
    tracing::info!("Shell {} has been closed", session_id);

    let store = ControllerSessionStore::new(cluster, rc);
    if let Err(e) = store.clear(host_name).await {
        tracing::warn!("Failed to remove shell annotation for {}: {}", host_name, e);
    }
    Ok(0)
}
