//! CLI command implementations

mod kill;
mod pod;
mod rc;
mod run;
mod support;
mod version;

pub use kill::kill_command;
pub use pod::{pod_command, PodArgs};
pub use rc::{rc_command, RcArgs};
pub use run::{run_command, RunArgs};
pub use support::{
    bash_script, connect_cluster, load_supervisor_config, resolve_command, run_supervised,
    write_bash_script, CommandSource,
};
pub use version::version_command;
