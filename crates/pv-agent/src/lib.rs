//! pv-agent: Remote execution on the claimed host
//!
//! Once a pod holds a lease it runs the supervised command on the host
//! through a [`RemoteSession`] (SSH or WinRM, chosen by the inventory
//! entry's transport) and relays the pod's declared ports to the host with
//! the [`forward`] module.

pub mod forward;
pub mod session;

pub use forward::{forwarding_enabled, start_port_forwarding, PortForward};
pub use session::{
    open_session, ExecOutcome, RemoteSession, RemoteTarget, SessionIo, SessionOptions,
    SessionState,
};
