//! Remote session management
//!
//! A [`RemoteSession`] runs one command on the claimed host and streams its
//! stdio. SSH sessions are stateless on the remote side; WinRM sessions
//! create a server-side shell whose id is recorded through a
//! [`SessionStore`] so a later pod (or the pre-stop hook) can close it.
//!
//! # State Machines
//!
//! - SSH: `Connecting -> Running -> Closed`
//! - WinRM: `Connecting -> SessionOpen -> Executing -> Closed`

mod ssh;
mod store;
mod winrm;

pub use ssh::SshSession;
pub use store::{ControllerSessionStore, SessionStore};
pub use winrm::{close_session, WinRmClient, WinRmSession};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use pv_core::error::SessionError;
use pv_core::inventory::{HostEntry, Transport};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet connected, or connecting
    Connecting,
    /// WinRM shell created
    SessionOpen,
    /// SSH command running
    Running,
    /// WinRM command running
    Executing,
    /// Closed; the session cannot be reused
    Closed,
}

/// Credential used to authenticate against the host
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// SSH private key file
    PrivateKey(PathBuf),
    /// WinRM password
    Password(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
            Credentials::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Where and as whom to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Inventory name, used to key the session handle
    pub name: String,
    /// Address
    pub host: String,
    /// Port
    pub port: u16,
    /// Remote user
    pub user: String,
    /// Transport
    pub transport: Transport,
    /// Credential for `transport`
    pub credentials: Credentials,
}

impl RemoteTarget {
    /// Build a target from an inventory entry.
    ///
    /// WinRM entries without a password fall back to `password_fallback`,
    /// entries without a port use `default_port`.
    pub fn from_entry(
        entry: &HostEntry,
        password_fallback: Option<&str>,
        default_port: u16,
    ) -> Result<Self, SessionError> {
        let credentials = match entry.transport {
            Transport::Ssh => entry
                .private_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(|k| Credentials::PrivateKey(PathBuf::from(k)))
                .ok_or_else(|| SessionError::MissingCredential {
                    host: entry.name.clone(),
                    what: "private key",
                })?,
            Transport::WinRm => entry
                .password
                .as_deref()
                .or(password_fallback)
                .filter(|p| !p.is_empty())
                .map(|p| Credentials::Password(p.to_string()))
                .ok_or_else(|| SessionError::MissingCredential {
                    host: entry.name.clone(),
                    what: "password",
                })?,
        };

        Ok(Self {
            name: entry.name.clone(),
            host: entry.host.clone(),
            port: entry.port.unwrap_or(default_port),
            user: entry.user.clone(),
            transport: entry.transport,
            credentials,
        })
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Remote exit code
    pub exit_code: i32,
}

impl ExecOutcome {
    /// True for exit code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Local ends of the remote command's stdio
pub struct SessionIo {
    /// Forwarded to the remote stdin
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    /// Receives remote stdout
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    /// Receives remote stderr
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SessionIo {
    /// The process's own stdio
    pub fn inherit() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

/// Options shared by both transports
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Timeout for establishing the connection
    pub connect_timeout: Option<Duration>,
    /// Where WinRM shell ids are persisted
    pub store: Option<Arc<dyn SessionStore>>,
    /// An interactive shell opened inside an already supervised pod.
    ///
    /// Re-entry shells neither close the recorded WinRM shell nor record
    /// their own.
    pub shell_reentry: bool,
}

/// A session able to run one command on a remote host
#[async_trait]
pub trait RemoteSession: Send {
    /// Current state
    fn state(&self) -> SessionState;

    /// Establish the connection and authenticate
    async fn connect(&mut self) -> Result<(), SessionError>;

    /// Run `command` with `env`, streaming stdio through `io` until it exits
    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        io: SessionIo,
    ) -> Result<ExecOutcome, SessionError>;

    /// Release remote resources; calling it again is a no-op
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Create the session matching the target's transport
pub fn open_session(
    target: RemoteTarget,
    options: SessionOptions,
) -> Result<Box<dyn RemoteSession>, SessionError> {
    match target.transport {
        Transport::Ssh => Ok(Box::new(SshSession::new(target, options.connect_timeout)?)),
        Transport::WinRm => Ok(Box::new(WinRmSession::new(target, options)?)),
    }
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
