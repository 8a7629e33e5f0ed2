//! podvisor: supervise processes on inventory hosts from cluster pods
//!
//! Provides the `podvisor` CLI. `rc` publishes an inventory group onto a
//! replication controller, `pod` runs inside each replica to claim a host
//! and supervise the remote command, and `kill` is the pre-stop hook that
//! closes what `pod` left open.

pub mod commands;
