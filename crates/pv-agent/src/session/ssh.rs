//! SSH transport

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, CryptoVec, Disconnect, Pty};
use russh_keys::key::PublicKey;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use pv_core::error::SessionError;

use super::{
    Credentials, ExecOutcome, RemoteSession, RemoteTarget, SessionIo, SessionState,
    DEFAULT_CONNECT_TIMEOUT,
};

/// Exit code reported when the channel closes without an exit status
const EXIT_CODE_UNKNOWN: i32 = 255;

/// Stdin chunk size
const STDIN_BUFFER_SIZE: usize = 8192;

/// Client handler; the inventory is the trust anchor for host addresses
struct ClientHandler {
    address: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key of {}: {}",
            self.address,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// Runs a command over an SSH channel with a PTY
pub struct SshSession {
    target: RemoteTarget,
    key_path: std::path::PathBuf,
    connect_timeout: Duration,
    handle: Option<Arc<Handle<ClientHandler>>>,
    state: SessionState,
}

impl SshSession {
    /// Create an unconnected session; the target must carry a private key
    pub fn new(target: RemoteTarget, connect_timeout: Option<Duration>) -> Result<Self, SessionError> {
        let key_path = match &target.credentials {
            Credentials::PrivateKey(path) => path.clone(),
            Credentials::Password(_) => {
                return Err(SessionError::MissingCredential {
                    host: target.name.clone(),
                    what: "private key",
                })
            }
        };
        Ok(Self {
            target,
            key_path,
            connect_timeout: connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            handle: None,
            state: SessionState::Connecting,
        })
    }
}

fn transport(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Transport(format!("{}: {}", context, err))
}

#[async_trait]
impl RemoteSession for SshSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let key = russh_keys::load_secret_key(&self.key_path, None).map_err(|e| {
            SessionError::KeyLoad {
                path: self.key_path.display().to_string(),
                message: e.to_string(),
            }
        })?;

        let address = self.target.address();
        tracing::info!(
            "Connecting to {} over SSH as user {}",
            address,
            self.target.user
        );
        let handler = ClientHandler {
            address: address.clone(),
        };
        let connect = client::connect(
            Arc::new(Config::default()),
            (self.target.host.as_str(), self.target.port),
            handler,
        );
        let mut handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| SessionError::Connect {
                address: address.clone(),
                message: "connection timed out".to_string(),
            })?
            .map_err(|e| SessionError::Connect {
                address: address.clone(),
                message: e.to_string(),
            })?;

        let authenticated = handle
            .authenticate_publickey(&self.target.user, Arc::new(key))
            .await
            .map_err(|e| transport("authentication", e))?;
        if !authenticated {
            return Err(SessionError::AuthenticationFailed {
                user: self.target.user.clone(),
                host: self.target.host.clone(),
            });
        }

        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        io: SessionIo,
    ) -> Result<ExecOutcome, SessionError> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| SessionError::Transport("session is not connected".to_string()))?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| transport("open channel", e))?;
        channel
            .request_pty(
                false,
                "xterm",
                80,
                40,
                0,
                0,
                &[(Pty::TTY_OP_ISPEED, 14400), (Pty::TTY_OP_OSPEED, 14400)],
            )
            .await
            .map_err(|e| transport("request pty", e))?;
        for (name, value) in env {
            channel
                .set_env(false, name.as_str(), value.as_str())
                .await
                .map_err(|e| transport("set env", e))?;
        }

        tracing::info!("Running command {}", command);
        channel
            .exec(true, command)
            .await
            .map_err(|e| transport("exec", e))?;
        self.state = SessionState::Running;

        let SessionIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        let channel_id = channel.id();
        let stdin_handle = Arc::clone(&handle);
        let stdin_task = tokio::spawn(async move {
            let mut buf = vec![0u8; STDIN_BUFFER_SIZE];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = CryptoVec::from_slice(&buf[..n]);
                        if stdin_handle.data(channel_id, chunk).await.is_err() {
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

        let mut exit_code = None;
        let mut output: Result<(), SessionError> = Ok(());
        while let Some(msg) = channel.wait().await {
            let written = match msg {
                ChannelMsg::Data { ref data } => write_all(&mut stdout, data).await,
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    write_all(&mut stderr, data).await
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                    Ok(())
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    tracing::warn!("Remote command terminated by signal {:?}", signal_name);
                    Ok(())
                }
                ChannelMsg::Close => break,
                _ => Ok(()),
            };
            if let Err(e) = written {
                output = Err(SessionError::Io(e));
                break;
            }
        }

        stdin_task.abort();
        let _ = stdin_task.await;
        output?;

        let exit_code = exit_code.unwrap_or(EXIT_CODE_UNKNOWN);
        tracing::info!("Command {} exited with code {}", command, exit_code);
        Ok(ExecOutcome { exit_code })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                tracing::debug!("Disconnect from {} failed: {}", self.target.address(), e);
            }
        }
        Ok(())
    }
}

async fn write_all<W>(out: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    out.write_all(data).await?;
    out.flush().await
}
