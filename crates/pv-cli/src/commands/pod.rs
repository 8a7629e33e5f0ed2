//! Pod command: claim a host and supervise the remote command on it

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use pv_agent::forward::{forwarding_enabled, start_port_forwarding, PORT_FORWARD_ENV};
use pv_agent::session::{ControllerSessionStore, SessionStore};
use pv_agent::{RemoteTarget, SessionOptions};
use pv_controller::lease::export_env_from_process;
use pv_controller::{Lease, LeaseConfig, LeaseCoordinator, LeaseError};
use pv_core::config::SupervisorConfig;
use pv_core::identity::pod_identity;

use super::support::{connect_cluster, resolve_command, run_supervised, write_bash_script};

/// Set to `true` inside a shell opened by the re-entry script
pub const SHELL_REENTRY_ENV: &str = "PV_IS_BASH_SHELL";

/// Arguments of `podvisor pod`
#[derive(Debug, Clone)]
pub struct PodArgs {
    /// Inventory group
    pub hosts: String,
    /// Command line words
    pub command: Vec<String>,
    /// Controller holding the inventory
    pub rc: String,
    /// Namespace override
    pub namespace: Option<String>,
    /// WinRM password when the entry has none
    pub password: Option<String>,
    /// Where to write the re-entry script
    pub bash: Option<PathBuf>,
}

/// True when `value` of `PV_IS_BASH_SHELL` marks a shell re-entry
pub fn is_shell_reentry(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Claim a host of `args.hosts` and run the command on it until it exits
pub async fn pod_command(args: PodArgs, config: &SupervisorConfig) -> Result<i32> {
    let self_pod = pod_identity().context("Couldn't get pod name")?;
    let cluster = connect_cluster(args.namespace.clone()).await?;

    let coordinator = LeaseCoordinator::new(cluster.clone(), LeaseConfig::from(config))
        .with_export_env(export_env_from_process());

    let lease = match coordinator.claim_host(&self_pod, &args.hosts, &args.rc).await {
        Ok(lease) => lease,
        Err(LeaseError::PodAnnotation { lease, source }) => {
            tracing::warn!(
                "Claimed host {} but could not annotate pod {}: {}",
                lease.entry.name,
                self_pod,
                source
            );
            *lease
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Couldn't find host")),
    };
    let Lease { entry, env, .. } = lease;

    let (command, source) = resolve_command(
        &args.command,
        entry.run_command.as_deref(),
        entry.transport,
        |name| std::env::var(name).ok(),
    )
    .map_err(|names| {
        let plural = if names.len() > 1 { "s" } else { "" };
        anyhow::anyhow!(
            "Could not find a command to execute from the environment variable{}: {}",
            plural,
            names.join(", ")
        )
    })?;
    tracing::debug!("Command taken from {:?}", source);
    tracing::info!(
        "Running command on host {} from {}: `{}`",
        entry.name,
        args.hosts,
        command
    );

    if let Some(path) = &args.bash {
        write_bash_script(path, &args.hosts, entry.transport).with_context(|| {
            format!("Failed to generate bash script at {}", path.display())
        })?;
    }

    let cancel = CancellationToken::new();
    if forwarding_enabled(std::env::var(PORT_FORWARD_ENV).ok().as_deref()) {
        match cluster.get_pod(&self_pod).await {
            Ok(Some(pod)) => {
                start_port_forwarding(&pod.ports, &entry.host, cancel.clone()).await;
            }
            Ok(None) => tracing::warn!("Pod {} not found, not forwarding ports", self_pod),
            Err(e) => tracing::warn!("Could not read pod {}: {}", self_pod, e),
        }
    }

    let target = RemoteTarget::from_entry(
        &entry,
        args.password.as_deref(),
        config.default_port(entry.transport),
    )?;
    let store: Arc<dyn SessionStore> =
        Arc::new(ControllerSessionStore::new(cluster.clone(), args.rc.clone()));
    let options = SessionOptions {
        connect_timeout: Some(config.connect_timeout),
        store: Some(store),
        shell_reentry: is_shell_reentry(std::env::var(SHELL_REENTRY_ENV).ok().as_deref()),
    };

    let result = run_supervised(target, options, &command, &env).await;
    cancel.cancel();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_reentry_flag() {
        assert!(is_shell_reentry(Some("true")));
        assert!(is_shell_reentry(Some("TRUE")));
        assert!(!is_shell_reentry(Some("false")));
        assert!(!is_shell_reentry(Some("1")));
        assert!(!is_shell_reentry(None));
    }
}
