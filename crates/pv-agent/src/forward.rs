//! Port forwarding from the worker pod to its claimed host
//!
//! Every container port declared on the pod is bound on all interfaces and
//! each accepted connection is spliced to the same port on the host, so
//! services of the host are reachable through the pod's address.

use std::net::SocketAddr;
use std::time::Duration;

use pv_core::types::ContainerPort;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment variable that disables forwarding when set to `false`
pub const PORT_FORWARD_ENV: &str = "PV_PORT_FORWARD";

/// Whether forwarding is enabled for the given `PV_PORT_FORWARD` value
pub fn forwarding_enabled(value: Option<&str>) -> bool {
    !matches!(value, Some(v) if v.trim().eq_ignore_ascii_case("false"))
}

/// One bound listener relaying to a remote address
pub struct PortForward {
    local_addr: SocketAddr,
    target: String,
    task: JoinHandle<()>,
}

impl PortForward {
    /// Bind `listen` and relay accepted connections to `target` until
    /// `cancel` fires
    pub async fn bind(
        listen: &str,
        target: impl Into<String>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let target = target.into();

        tracing::info!("Forwarding {} to {}", local_addr, target);
        let task = tokio::spawn(accept_loop(listener, target.clone(), cancel));

        Ok(Self {
            local_addr,
            target,
            task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address connections are relayed to
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the accept loop to stop
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Forward every declared port of the pod to `host`.
///
/// Ports that cannot be bound are logged and skipped.
pub async fn start_port_forwarding(
    ports: &[ContainerPort],
    host: &str,
    cancel: CancellationToken,
) -> Vec<PortForward> {
    let mut forwards = Vec::with_capacity(ports.len());
    for port in ports {
        let listen = format!("0.0.0.0:{}", port.port);
        let target = format!("{}:{}", host, port.port);
        match PortForward::bind(&listen, target, cancel.clone()).await {
            Ok(forward) => {
                tracing::info!(
                    "Port {} ({}) forwarded to {}",
                    port.port,
                    port.name.as_deref().unwrap_or("unnamed"),
                    forward.target()
                );
                forwards.push(forward);
            }
            Err(e) => {
                tracing::warn!("Could not listen on {}: {}", listen, e);
            }
        }
    }
    forwards
}

const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(50);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Pause after `failures` consecutive accept errors, doubling up to a cap
fn accept_retry_delay(failures: u32) -> Duration {
    ACCEPT_RETRY_BASE
        .saturating_mul(1u32 << failures.saturating_sub(1).min(5))
        .min(ACCEPT_RETRY_MAX)
}

async fn accept_loop(listener: TcpListener, target: String, cancel: CancellationToken) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Stopped forwarding to {}", target);
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        failures = 0;
                        tracing::debug!("Accepted {} for {}", peer, target);
                        tokio::spawn(relay(socket, target.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_retry_delay(failures);
                        tracing::error!(
                            "Failed to accept connection: {} (retrying in {:?})",
                            e,
                            delay
                        );
                        // EMFILE and friends fail again immediately
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

async fn relay(inbound: TcpStream, target: String, cancel: CancellationToken) {
    let outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to connect to {}: {}", target, e);
            return;
        }
    };

    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();

    let mut upstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut in_read, &mut out_write).await;
        let _ = out_write.shutdown().await;
        result
    });
    let mut downstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut out_read, &mut in_write).await;
        let _ = in_write.shutdown().await;
        result
    });

    // Either side finishing tears down both
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = &mut upstream => {
            if let Ok(Err(e)) = result {
                tracing::debug!("Relay to {} ended: {}", target, e);
            }
        }
        result = &mut downstream => {
            if let Ok(Err(e)) = result {
                tracing::debug!("Relay from {} ended: {}", target, e);
            }
        }
    }

    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;
}
