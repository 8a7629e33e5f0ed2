//! Supervisor tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::inventory::{Transport, DEFAULT_SSH_PORT, DEFAULT_WINRM_PORT};

/// Tuning knobs for the lease loop and remote connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Claim attempts before giving up
    pub max_attempts: u32,

    /// Lower bound of the random sleep between claim attempts
    #[serde(with = "duration_secs")]
    pub backoff_min: Duration,

    /// Upper bound of the random sleep between claim attempts
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,

    /// Timeout for establishing a remote connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Port used for SSH hosts without an explicit port
    pub ssh_port: u16,

    /// Port used for WinRM hosts without an explicit port
    pub winrm_port: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            ssh_port: DEFAULT_SSH_PORT,
            winrm_port: DEFAULT_WINRM_PORT,
        }
    }
}

impl SupervisorConfig {
    /// Port for hosts of `transport` that do not set `ansible_port`
    pub fn default_port(&self, transport: Transport) -> u16 {
        match transport {
            Transport::Ssh => self.ssh_port,
            Transport::WinRm => self.winrm_port,
        }
    }

    /// Reject settings the lease loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::Invalid(format!(
                "backoff_min ({}s) exceeds backoff_max ({}s)",
                self.backoff_min.as_secs(),
                self.backoff_max.as_secs()
            )));
        }
        Ok(())
    }
}
