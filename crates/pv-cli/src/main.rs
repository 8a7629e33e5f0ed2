//! podvisor CLI
//!
//! Single binary for every podvisor role:
//! - `rc` publishes an inventory group onto a replication controller
//! - `pod` runs inside each replica and supervises a command on one host
//! - `kill` is the replicas' pre-stop hook
//! - `run` tries a command against an explicit host

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podvisor::commands::{self, PodArgs, RcArgs, RunArgs};

#[derive(Parser)]
#[command(name = "podvisor")]
#[command(
    author,
    version,
    about = "Supervise processes on inventory hosts from replicated cluster pods"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "PV_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to work in (defaults to the client's namespace)
    #[arg(short, long, global = true, env = "PV_NAMESPACE")]
    namespace: Option<String>,

    /// Enable verbose debugging output
    #[arg(long, global = true)]
    debug: bool,

    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim a host from the inventory and run a remote command on it
    Pod {
        /// Inventory group to pick a host from
        #[arg(env = "PV_HOSTS")]
        hosts: String,
        /// Command to run; falls back to PV_COMMAND_<TRANSPORT> and PV_COMMAND
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Replication controller holding the inventory
        #[arg(long, env = "PV_RC")]
        rc: String,
        /// Password for WinRM hosts without one in the inventory
        #[arg(long, env = "PV_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Write a script opening a shell on the claimed host to this path
        #[arg(long, env = "PV_BASH")]
        bash: Option<PathBuf>,
    },

    /// Create or update the replication controller for an inventory group
    Rc {
        /// Inventory group to publish
        hosts: String,
        /// Location of the inventory file
        #[arg(long, default_value = "inventory")]
        inventory: PathBuf,
        /// Controller manifest (defaults to kubernetes/<hosts>/rc.yml)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Directory containing group_vars/ and kubernetes/
        #[arg(long, default_value = ".")]
        playbook_dir: PathBuf,
        /// Number of replicas; -1 keeps the current count
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        replicas: i32,
    },

    /// Run a remote command on a given host to test SSH / WinRM
    Run {
        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
        /// Host for the remote connection
        #[arg(long, env = "PV_HOST")]
        host: Option<String>,
        /// User for the remote connection
        #[arg(long, env = "PV_USER")]
        user: Option<String>,
        /// Port (defaults to 22 for SSH, 5985 for WinRM)
        #[arg(long)]
        port: Option<u16>,
        /// Private key used for SSH
        #[arg(long, env = "PV_PRIVATEKEY")]
        privatekey: Option<String>,
        /// Password used for WinRM
        #[arg(long, env = "PV_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Connection type: ssh (default) or winrm
        #[arg(long)]
        connection: Option<String>,
    },

    /// Close the WinRM shell of this pod (pre-stop hook)
    Kill {
        /// Replication controller holding the inventory
        #[arg(long, env = "PV_RC")]
        rc: String,
        /// Password for WinRM hosts without one in the inventory
        #[arg(long, env = "PV_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.debug, cli.verbose) {
        (true, _, _) => "error",
        (false, true, _) => "debug",
        (false, false, 0) => "info",
        (false, false, 1) => "debug",
        (false, false, _) => "trace",
    };

    // Remote output owns stdout
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Failed: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Pod {
            hosts,
            command,
            rc,
            password,
            bash,
        } => {
            let config = commands::load_supervisor_config(cli.config.as_deref())?;
            let args = PodArgs {
                hosts,
                command,
                rc,
                namespace: cli.namespace,
                password,
                bash,
            };
            commands::pod_command(args, &config).await
        }

        Commands::Rc {
            hosts,
            inventory,
            manifest,
            playbook_dir,
            replicas,
        } => {
            let args = RcArgs {
                hosts,
                inventory,
                manifest,
                playbook_dir,
                replicas,
                namespace: cli.namespace,
            };
            commands::rc_command(args).await
        }

        Commands::Run {
            command,
            host,
            user,
            port,
            privatekey,
            password,
            connection,
        } => {
            let config = commands::load_supervisor_config(cli.config.as_deref())?;
            let args = RunArgs {
                host,
                user,
                port,
                private_key: privatekey,
                password,
                connection,
                command,
            };
            commands::run_command(args, &config).await
        }

        Commands::Kill { rc, password } => {
            let config = commands::load_supervisor_config(cli.config.as_deref())?;
            commands::kill_command(&rc, cli.namespace, password.as_deref(), &config).await
        }

        Commands::Version => {
            commands::version_command();
            Ok(0)
        }
    }
}
