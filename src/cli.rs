//! Command-line interface for lxe-net
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// lxe-net - bridge and CNI network provisioning for LXE containers
#[derive(Parser)]
#[command(name = "lxe-net")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "lxe-net.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Check,

    /// Managed bridge operations
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },

    /// CNI attachment operations
    Cni {
        #[command(subcommand)]
        action: CniAction,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Bridge subcommands
#[derive(Subcommand)]
pub enum BridgeAction {
    /// Create or reconcile the managed bridge
    Ensure {
        /// Bridge name (overrides config)
        #[arg(long)]
        name: Option<String>,

        /// IPv4 CIDR for the bridge (overrides config; empty for auto)
        #[arg(long)]
        cidr: Option<String>,

        /// Only create the bridge, leave an existing one untouched
        #[arg(long)]
        create_only: bool,
    },

    /// Pick an unused address on the bridge
    FreeIp {
        /// Bridge name (overrides config)
        #[arg(long)]
        name: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// CNI subcommands
#[derive(Subcommand)]
pub enum CniAction {
    /// Attach a running container to its pod network
    Attach {
        /// Pod namespace
        #[arg(long)]
        namespace: String,

        /// Sandbox (pod) name
        #[arg(long)]
        name: String,

        /// Container ID
        #[arg(long)]
        container: String,

        /// Container process ID
        #[arg(long)]
        pid: i64,
    },

    /// Detach a container from its pod network
    Detach {
        /// Pod namespace
        #[arg(long)]
        namespace: String,

        /// Sandbox (pod) name
        #[arg(long)]
        name: String,

        /// Container ID
        #[arg(long)]
        container: String,

        /// Container process ID (0 when the process has exited)
        #[arg(long, default_value_t = 0)]
        pid: i64,
    },

    /// Check a container's network against a stored attach result
    Status {
        /// Pod namespace
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Sandbox (pod) name
        #[arg(long)]
        name: String,

        /// Container ID
        #[arg(long)]
        container: String,

        /// Container process ID
        #[arg(long, default_value_t = 0)]
        pid: i64,

        /// Stored CNI result JSON
        #[arg(long)]
        result: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "lxe-net", &mut std::io::stdout());
    }
}
