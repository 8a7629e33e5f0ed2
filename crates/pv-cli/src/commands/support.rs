//! Helpers shared by the commands

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use pv_agent::{open_session, RemoteTarget, SessionIo, SessionOptions};
use pv_controller::template::env;
use pv_controller::KubeCluster;
use pv_core::config::{self, SupervisorConfig};
use pv_core::error::SessionError;
use pv_core::{Cluster, Transport};

/// Exit code reported when the supervised command was interrupted
const EXIT_INTERRUPTED: i32 = 130;

/// Connect to the cluster API
pub async fn connect_cluster(namespace: Option<String>) -> Result<Arc<dyn Cluster>> {
    let cluster = KubeCluster::connect(namespace)
        .await
        .context("Failed to create Kubernetes client. Maybe you need to log in to the cluster?")?;
    tracing::debug!("Using namespace {}", cluster.namespace());
    Ok(Arc::new(cluster))
}

/// Load the supervisor settings.
///
/// An explicit path must exist; the default path may be absent.
pub fn load_supervisor_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    let config: SupervisorConfig = match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let path = config::default_config_path();
            config::load_config_or_default(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
    };
    config.validate()?;
    Ok(config)
}

/// Where a command line may come from, in order of precedence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// `app_run_command` of the inventory entry
    Inventory,
    /// Command line arguments
    Arguments,
    /// An environment variable
    Environment(String),
}

/// Work out the remote command line.
///
/// The inventory entry's override wins, then the command line arguments,
/// then `PV_COMMAND_<TRANSPORT>` and finally `PV_COMMAND`. On failure the
/// names of the variables that were consulted are returned.
pub fn resolve_command<F>(
    args: &[String],
    run_command: Option<&str>,
    transport: Transport,
    lookup: F,
) -> Result<(String, CommandSource), Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(command) = run_command.filter(|c| !c.trim().is_empty()) {
        return Ok((command.to_string(), CommandSource::Inventory));
    }
    let joined = args.join(" ");
    if !joined.trim().is_empty() {
        return Ok((joined, CommandSource::Arguments));
    }

    let names = vec![
        format!(
            "{}{}",
            env::COMMAND_PREFIX,
            transport.as_str().to_ascii_uppercase()
        ),
        env::COMMAND.to_string(),
    ];
    for name in &names {
        if let Some(command) = lookup(name).filter(|c| !c.trim().is_empty()) {
            return Ok((command, CommandSource::Environment(name.clone())));
        }
    }
    Err(names)
}

/// Shell script that re-enters the claimed host interactively
pub fn bash_script(group: &str, transport: Transport) -> String {
    let shell = match transport {
        Transport::Ssh => "bash",
        Transport::WinRm => "cmd",
    };
    format!(
        "#!/bin/sh\n\
         echo \"opening shell on remote machine...\"\n\
         export PV_IS_BASH_SHELL=true\n\
         export {}=false\n\
         podvisor pod {} {}\n",
        pv_agent::forward::PORT_FORWARD_ENV,
        group,
        shell
    )
}

/// Write the re-entry script to `path` as an executable, read-only file
pub fn write_bash_script(path: &Path, group: &str, transport: Transport) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    // A previous run leaves the file read-only
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    std::fs::write(path, bash_script(group, transport))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o555))?;
    }
    Ok(())
}

/// Connect, run `command` with the process stdio and close the session.
///
/// Returns the remote exit code. A non-zero exit is not an error.
pub async fn run_supervised(
    target: RemoteTarget,
    options: SessionOptions,
    command: &str,
    env: &BTreeMap<String, String>,
) -> Result<i32> {
    let name = target.name.clone();
    let address = target.address();
    let mut session = open_session(target, options)?;

    if let Err(e) = session.connect().await {
        if let Err(close_err) = session.close().await {
            tracing::warn!("Failed to close session to {}: {}", address, close_err);
        }
        return Err(anyhow::Error::new(e).context(format!("Could not connect to {}", address)));
    }

    let result = tokio::select! {
        result = session.execute(command, env, SessionIo::inherit()) => Some(result),
        _ = shutdown_signal() => None,
    };

    if let Err(e) = session.close().await {
        tracing::warn!("Failed to close session to {}: {}", address, e);
    }

    match result {
        None => {
            tracing::info!("Interrupted, session to {} closed", address);
            Ok(EXIT_INTERRUPTED)
        }
        Some(Ok(outcome)) => {
            if !outcome.success() {
                tracing::warn!("Command exited with code {}", outcome.exit_code);
            }
            Ok(outcome.exit_code)
        }
        Some(Err(SessionError::CommandFailed { command, exit_code })) => {
            tracing::warn!("Command `{}` exited with code {}", command, exit_code);
            Ok(exit_code)
        }
        Some(Err(e)) => {
            Err(anyhow::Error::new(e).context(format!("Failed to run command on host {}", name)))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, closing session...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, closing session...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_inventory_override_wins() {
        let args = vec!["echo".to_string(), "hi".to_string()];
        let (command, source) =
            resolve_command(&args, Some("/opt/app/run.sh"), Transport::Ssh, no_env).unwrap();
        assert_eq!(command, "/opt/app/run.sh");
        assert_eq!(source, CommandSource::Inventory);
    }

    #[test]
    fn test_arguments_joined() {
        let args = vec!["tail".to_string(), "-f".to_string(), "/var/log/app".to_string()];
        let (command, source) = resolve_command(&args, None, Transport::Ssh, no_env).unwrap();
        assert_eq!(command, "tail -f /var/log/app");
        assert_eq!(source, CommandSource::Arguments);
    }

    #[test]
    fn test_transport_specific_variable_first() {
        let lookup = |name: &str| match name {
            "PV_COMMAND_WINRM" => Some("C:\\app\\run.bat".to_string()),
            "PV_COMMAND" => Some("/opt/app/run.sh".to_string()),
            _ => None,
        };
        let (command, source) = resolve_command(&[], None, Transport::WinRm, lookup).unwrap();
        assert_eq!(command, "C:\\app\\run.bat");
        assert_eq!(source, CommandSource::Environment("PV_COMMAND_WINRM".to_string()));

        let (command, _) = resolve_command(&[], None, Transport::Ssh, lookup).unwrap();
        assert_eq!(command, "/opt/app/run.sh");
    }

    #[test]
    fn test_no_command_lists_variables() {
        let err = resolve_command(&[], Some("  "), Transport::Ssh, no_env).unwrap_err();
        assert_eq!(err, vec!["PV_COMMAND_SSH".to_string(), "PV_COMMAND".to_string()]);
    }

    #[test]
    fn test_bash_script_contents() {
        let script = bash_script("appservers", Transport::WinRm);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("export PV_IS_BASH_SHELL=true\n"));
        assert!(script.contains("export PV_PORT_FORWARD=false\n"));
        assert!(script.ends_with("podvisor pod appservers cmd\n"));

        assert!(bash_script("web", Transport::Ssh).ends_with("podvisor pod web bash\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_bash_script_is_executable_and_rewritable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin").join("bash");
        write_bash_script(&path, "appservers", Transport::Ssh).unwrap();
        write_bash_script(&path, "appservers", Transport::WinRm).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("cmd\n"));
    }
}
