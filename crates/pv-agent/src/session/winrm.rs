//! WinRM transport
//!
//! Speaks WS-Management over plain HTTP with basic authentication. Each
//! execution creates a remote shell, records its id, runs the command in it
//! and deletes the shell afterwards. A shell left behind by a killed pod is
//! closed by the next execution on the same host.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use pv_core::error::SessionError;
use pv_protocol::envelope::DEFAULT_OPERATION_TIMEOUT_SECS;
use pv_protocol::response::{check_fault, parse_command_id, parse_receive, parse_shell_id};
use pv_protocol::{CommandId, CommandOutput, Envelope, ProtocolError, ShellId};

use super::{
    Credentials, ExecOutcome, RemoteSession, RemoteTarget, SessionIo, SessionOptions,
    SessionState, SessionStore, DEFAULT_CONNECT_TIMEOUT,
};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// Stdin chunk size; stays well below the envelope size once base64 encoded
const STDIN_BUFFER_SIZE: usize = 32 * 1024;

/// HTTP client for one WinRM endpoint
#[derive(Clone)]
pub struct WinRmClient {
    http: reqwest::Client,
    envelope: Envelope,
    user: String,
    password: String,
}

impl WinRmClient {
    /// Create a client for `http://<host>:<port>/wsman`
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let endpoint = endpoint_url(host, port);
        // Receive long-polls for the operation timeout
        let request_timeout = Duration::from_secs(u64::from(DEFAULT_OPERATION_TIMEOUT_SECS) + 30);
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| SessionError::Transport(format!("Could not create WinRM client: {}", e)))?;

        Ok(Self {
            http,
            envelope: Envelope::new(endpoint),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Create a client from a target carrying a password
    pub fn for_target(target: &RemoteTarget, connect_timeout: Duration) -> Result<Self, SessionError> {
        match &target.credentials {
            Credentials::Password(password) => {
                Self::new(&target.host, target.port, &target.user, password, connect_timeout)
            }
            Credentials::PrivateKey(_) => Err(SessionError::MissingCredential {
                host: target.name.clone(),
                what: "password",
            }),
        }
    }

    /// Endpoint URL
    pub fn endpoint(&self) -> &str {
        self.envelope.endpoint()
    }

    async fn post(&self, body: String) -> Result<String, SessionError> {
        let response = self
            .http
            .post(self.envelope.endpoint())
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    SessionError::Connect {
                        address: self.envelope.endpoint().to_string(),
                        message: e.to_string(),
                    }
                } else {
                    SessionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthenticationFailed {
                user: self.user.clone(),
                host: self.envelope.endpoint().to_string(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        // Faults arrive with a 500 status and a SOAP body
        check_fault(&text)?;
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "WinRM endpoint {} answered {}",
                self.envelope.endpoint(),
                status
            )));
        }
        Ok(text)
    }

    /// Open a shell
    pub async fn create_shell(&self) -> Result<ShellId, SessionError> {
        let xml = self.post(self.envelope.create_shell()).await?;
        Ok(parse_shell_id(&xml)?)
    }

    /// Start `command` in `shell`
    pub async fn execute(&self, shell: &ShellId, command: &str) -> Result<CommandId, SessionError> {
        let xml = self.post(self.envelope.execute(shell, command)).await?;
        Ok(parse_command_id(&xml)?)
    }

    /// Send stdin to a running command
    pub async fn send_input(
        &self,
        shell: &ShellId,
        command: &CommandId,
        data: &[u8],
        end: bool,
    ) -> Result<(), SessionError> {
        self.post(self.envelope.send_input(shell, command, data, end))
            .await
            .map(|_| ())
    }

    /// Poll output; `Ok(None)` when the server timed out without output
    pub async fn receive(
        &self,
        shell: &ShellId,
        command: &CommandId,
    ) -> Result<Option<CommandOutput>, SessionError> {
        match self.post(self.envelope.receive(shell, command)).await {
            Ok(xml) => Ok(Some(parse_receive(&xml)?)),
            Err(SessionError::Protocol(ProtocolError::Fault(fault))) if fault.is_timeout() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Terminate a running command
    pub async fn signal_terminate(&self, shell: &ShellId, command: &CommandId) -> Result<(), SessionError> {
        self.post(self.envelope.signal_terminate(shell, command))
            .await
            .map(|_| ())
    }

    /// Delete a shell and every process started in it.
    ///
    /// A shell the server does not know is already closed and counts as
    /// success.
    pub async fn delete_shell(&self, shell: &ShellId) -> Result<(), SessionError> {
        match self.post(self.envelope.delete_shell(shell)).await {
            Ok(_) => Ok(()),
            Err(SessionError::Protocol(ProtocolError::Fault(fault))) if fault.is_shell_not_found() => {
                tracing::debug!("Shell {} was already closed", shell);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// WinRM endpoint URL for a host
pub fn endpoint_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/wsman", host, port)
}

/// Close the shell `session_id` on `target`.
///
/// Idempotent: unknown or already closed shells are success.
pub async fn close_session(target: &RemoteTarget, session_id: &str) -> Result<(), SessionError> {
    let client = WinRmClient::for_target(target, DEFAULT_CONNECT_TIMEOUT)?;
    tracing::info!("Closing shell {} on {}", session_id, client.endpoint());
    client.delete_shell(&ShellId::new(session_id)).await
}

/// Runs a command inside a WinRM shell
pub struct WinRmSession {
    target: RemoteTarget,
    client: WinRmClient,
    store: Option<Arc<dyn SessionStore>>,
    shell_reentry: bool,
    shell: Option<ShellId>,
    state: SessionState,
}

impl WinRmSession {
    /// Create an unconnected session; the target must carry a password
    pub fn new(target: RemoteTarget, options: SessionOptions) -> Result<Self, SessionError> {
        let client = WinRmClient::for_target(
            &target,
            options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )?;
        Ok(Self {
            target,
            client,
            store: options.store,
            shell_reentry: options.shell_reentry,
            shell: None,
            state: SessionState::Connecting,
        })
    }

    /// Id of the open shell, if any
    pub fn shell_id(&self) -> Option<&ShellId> {
        self.shell.as_ref()
    }

    /// Records shell ids unless this is a shell re-entry
    fn tracking_store(&self) -> Option<&Arc<dyn SessionStore>> {
        if self.shell_reentry {
            None
        } else {
            self.store.as_ref()
        }
    }

    async fn close_previous_shell(&self) {
        let Some(store) = self.tracking_store() else {
            return;
        };
        let previous = match store.load(&self.target.name).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Could not look up previous shell of {}: {}", self.target.name, e);
                return;
            }
        };
        tracing::info!("Closing the old WinRM shell {}", previous);
        if let Err(e) = self.client.delete_shell(&ShellId::new(previous.clone())).await {
            tracing::warn!("Failed to close shell {}: {}", previous, e);
        }
    }

    async fn run(&self, shell: &ShellId, command: &str, io: SessionIo) -> Result<i32, SessionError> {
        let command_id = self.client.execute(shell, command).await?;

        let SessionIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        let client = self.client.clone();
        let stdin_shell = shell.clone();
        let stdin_command = command_id.clone();
        let stdin_task = tokio::spawn(async move {
            let mut buf = vec![0u8; STDIN_BUFFER_SIZE];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client
                            .send_input(&stdin_shell, &stdin_command, &buf[..n], false)
                            .await
                        {
                            tracing::debug!("Stopped forwarding stdin: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Stopped reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let result = self
            .receive_until_done(shell, &command_id, &mut stdout, &mut stderr)
            .await;

        stdin_task.abort();
        let _ = stdin_task.await;

        if result.is_err() {
            if let Err(e) = self.client.signal_terminate(shell, &command_id).await {
                tracing::debug!("Failed to terminate command {}: {}", command_id, e);
            }
        }
        result
    }

    async fn receive_until_done(
        &self,
        shell: &ShellId,
        command: &CommandId,
        stdout: &mut Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stderr: &mut Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Result<i32, SessionError> {
        loop {
            let Some(output) = self.client.receive(shell, command).await? else {
                continue;
            };
            if !output.stdout.is_empty() {
                stdout.write_all(&output.stdout).await?;
                stdout.flush().await?;
            }
            if !output.stderr.is_empty() {
                stderr.write_all(&output.stderr).await?;
                stderr.flush().await?;
            }
            if output.done {
                return Ok(output.exit_code.unwrap_or(0));
            }
        }
    }
}

#[async_trait]
impl RemoteSession for WinRmSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        tracing::info!(
            "Connecting to windows host over WinRM at {} with user {}",
            self.client.endpoint(),
            self.target.user
        );
        self.close_previous_shell().await;

        let shell = self.client.create_shell().await?;
        tracing::info!("Created WinRM shell {}", shell);
        self.shell = Some(shell.clone());
        self.state = SessionState::SessionOpen;

        if let Some(store) = self.tracking_store() {
            store.save(&self.target.name, shell.as_str()).await?;
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        io: SessionIo,
    ) -> Result<ExecOutcome, SessionError> {
        let shell = self
            .shell
            .clone()
            .ok_or_else(|| SessionError::Transport("no WinRM shell is open".to_string()))?;
        if !env.is_empty() {
            tracing::debug!("Environment variables are not forwarded over WinRM");
        }

        self.state = SessionState::Executing;
        tracing::info!("Running command {}", command);
        let exit_code = self.run(&shell, command, io).await?;

        if exit_code != 0 {
            return Err(SessionError::CommandFailed {
                command: command.to_string(),
                exit_code,
            });
        }
        Ok(ExecOutcome { exit_code })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;

        let Some(shell) = self.shell.take() else {
            return Ok(());
        };
        self.client.delete_shell(&shell).await?;
        if let Some(store) = self.tracking_store() {
            if let Err(e) = store.clear(&self.target.name).await {
                tracing::warn!("Failed to forget shell {}: {}", shell, e);
            }
        }
        Ok(())
    }
}
