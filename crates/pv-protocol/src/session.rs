//! Identifier types for remote shells and commands

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-issued identifier of a WinRM shell
///
/// This is the session handle that must be deleted explicitly to free the
/// remote processes started inside the shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShellId(pub String);

impl ShellId {
    /// Create a new shell ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ShellId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ShellId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a command running inside a shell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
