//! pv-protocol: WS-Management wire format for podvisor
//!
//! This crate builds and parses the SOAP envelopes exchanged with a WinRM
//! endpoint: shell creation, command execution, stream send/receive,
//! signalling and shell deletion. It performs no I/O.

pub mod envelope;
pub mod error;
pub mod response;
pub mod session;

pub use envelope::{Action, Envelope, DEFAULT_MAX_ENVELOPE_SIZE, SHELL_RESOURCE_URI};
pub use error::ProtocolError;
pub use response::{CommandOutput, Fault};
pub use session::{CommandId, ShellId};
