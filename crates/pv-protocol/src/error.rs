//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding WS-Management responses
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The endpoint answered with a SOAP fault
    #[error("WS-Management fault {}: {}", .0.code(), .0.reason)]
    Fault(crate::response::Fault),

    /// A required element was absent from the response
    #[error("Missing element <{0}> in response")]
    MissingElement(&'static str),

    /// Stream payload was not valid base64
    #[error("Invalid stream payload: {0}")]
    InvalidStream(#[from] base64::DecodeError),

    /// Exit code could not be parsed
    #[error("Invalid exit code: {0}")]
    InvalidExitCode(String),
}
