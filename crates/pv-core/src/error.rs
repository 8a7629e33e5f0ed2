//! Core error types for podvisor

use pv_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the podvisor crates
#[derive(Error, Debug)]
pub enum PvError {
    /// Inventory error
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Remote session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inventory loading errors
#[derive(Error, Debug)]
pub enum InventoryError {
    /// The requested group header is not in the inventory file
    #[error(
        "Could not find hosts `{group}` in inventory file {}. Possible values are: {}",
        path.display(),
        available.join(", ")
    )]
    GroupNotFound {
        group: String,
        path: PathBuf,
        available: Vec<String>,
    },

    /// Inventory file could not be read
    #[error("Failed to read inventory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the cluster API
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Optimistic concurrency failure: the object changed since it was read
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Any other API failure (unreachable server, forbidden, invalid object)
    #[error("Cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// True for optimistic concurrency failures
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

/// Remote session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The credential needed by the transport is missing
    #[error("Missing credential for host {host}: {what}")]
    MissingCredential { host: String, what: &'static str },

    /// Private key could not be loaded
    #[error("Failed to load private key {path}: {message}")]
    KeyLoad { path: String, message: String },

    /// Could not reach the host
    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// The host rejected our credentials
    #[error("Authentication rejected for user {user} on {host}")]
    AuthenticationFailed { user: String, host: String },

    /// Transport-level failure after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session handle could not be persisted or looked up
    #[error("Session store error: {0}")]
    Store(#[from] ClusterError),

    /// The remote command ran and exited non-zero
    #[error("Command `{command}` exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    /// Local stdio failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// YAML parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(path: &str) -> Result<(), PvError> {
        Err(InventoryError::Io {
            path: PathBuf::from(path),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        Ok(())
    }

    #[test]
    fn test_concern_errors_convert_into_pv_error() {
        let err = load("/etc/inventory").unwrap_err();
        assert!(matches!(err, PvError::Inventory(InventoryError::Io { .. })));
        assert!(err.to_string().starts_with("Inventory error: Failed to read inventory /etc/inventory"));

        let err: PvError = SessionError::from(ClusterError::Conflict {
            kind: "ReplicationController",
            name: "web".into(),
        })
        .into();
        assert_eq!(
            err.to_string(),
            "Session error: Session store error: ReplicationController web was modified concurrently"
        );
    }

    #[test]
    fn test_is_conflict() {
        assert!(ClusterError::Conflict { kind: "Pod", name: "p".into() }.is_conflict());
        assert!(!ClusterError::NotFound { kind: "Pod", name: "p".into() }.is_conflict());
        assert!(!ClusterError::Api("boom".into()).is_conflict());
    }
}
