use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Profile;

/// botstrap - declarative, idempotent host provisioning for bot services
#[derive(Parser, Debug)]
#[command(name = "botstrap")]
#[command(about = "Provision a host to run a bot: runtime, packages, env file and service")]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON). Overrides --profile.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Built-in profile used when no configuration file is given
    #[arg(short, long, global = true, default_value_t = Profile::LinuxService)]
    pub profile: Profile,

    /// Dry-run mode: run the read-only checks, but only log the commands
    /// and file writes that would establish the desired state.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Execute the provisioning plan (default)
    Run,
    /// List the plan's steps with their failure policies and undo hints
    Plan,
    /// Print the rendered systemd unit
    Unit,
    /// Write the selected profile to a configuration file to edit
    Init {
        /// Where to write the configuration
        #[arg(default_value = "botstrap.json")]
        file: PathBuf,

        /// Replace the file if it already exists
        #[arg(long)]
        force: bool,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        file: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Subcommand to run, `run` when none was given
    pub fn command(&self) -> &Commands {
        self.command.as_ref().unwrap_or(&Commands::Run)
    }
}
