use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "isoprov",
    about = "Provision controller and compute VMs from an installer ISO via libvirt"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "isoprov.toml", global = true)]
    pub config: PathBuf,

    /// Show every log line while steps run
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only show step results
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Interactive,
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the host can afford the configured plan
    Check,

    /// Provision every node and install controller-0 from the ISO
    Up {
        /// Installation ISO attached to controller-0
        #[arg(short, long)]
        iso: PathBuf,

        /// Apply this configuration file (path on the installed machine)
        #[arg(long, value_name = "REMOTE_PATH")]
        apply: Option<String>,
    },

    /// Run the console installation against an already started domain
    Install {
        /// Domain whose serial console drives the installer
        #[arg(long, default_value = "controller-0")]
        domain: String,

        /// Apply this configuration file (path on the installed machine)
        #[arg(long, value_name = "REMOTE_PATH")]
        apply: Option<String>,
    },

    /// Stop and remove every node of the plan with its disk images
    Destroy,

    /// Show console transcripts
    Log {
        /// Show the latest failed transcript
        #[arg(long)]
        failed: bool,

        /// List all transcripts
        #[arg(long)]
        all: bool,

        /// Show the tool's own log instead
        #[arg(long)]
        tool: bool,
    },
}
