//! Run command: one-off remote command to test SSH / WinRM access

use anyhow::{bail, Result};

use pv_agent::session::Credentials;
use pv_agent::{RemoteTarget, SessionOptions};
use pv_core::config::SupervisorConfig;
use pv_core::Transport;

use super::support::run_supervised;

/// Arguments of `podvisor run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Host address
    pub host: Option<String>,
    /// Remote user
    pub user: Option<String>,
    /// Port; the transport default when absent
    pub port: Option<u16>,
    /// Private key for SSH
    pub private_key: Option<String>,
    /// Password for WinRM
    pub password: Option<String>,
    /// Connection type, `ssh` unless `winrm`
    pub connection: Option<String>,
    /// Command line words
    pub command: Vec<String>,
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => Ok(v),
        None => bail!("{} is required", what),
    }
}

/// Build the target described by the flags
pub fn run_target(args: &RunArgs, config: &SupervisorConfig) -> Result<RemoteTarget> {
    let host = required(args.host.clone(), "Host")?;
    let user = required(args.user.clone(), "User")?;
    let transport = args
        .connection
        .as_deref()
        .and_then(Transport::from_connection)
        .unwrap_or_default();

    let credentials = match transport {
        Transport::Ssh => {
            Credentials::PrivateKey(required(args.private_key.clone(), "Private key")?.into())
        }
        Transport::WinRm => Credentials::Password(required(args.password.clone(), "Password")?),
    };

    Ok(RemoteTarget {
        name: host.clone(),
        host,
        port: args.port.unwrap_or_else(|| config.default_port(transport)),
        user,
        transport,
        credentials,
    })
}

/// Run a single command on an explicit host
pub async fn run_command(args: RunArgs, config: &SupervisorConfig) -> Result<i32> {
    let command = required(Some(args.command.join(" ")), "Command")?;
    let target = run_target(&args, config)?;
    tracing::info!(
        "Running `{}` on {} over {}",
        command,
        target.address(),
        target.transport
    );

    let options = SessionOptions {
        connect_timeout: Some(config.connect_timeout),
        ..Default::default()
    };
    run_supervised(target, options, &command, &Default::default()).await
}
