use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Register a background agent with the native service supervisor")]
pub struct Args {
    /// Path to configuration file (default: <config dir>/daemonctl/daemonctl.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log every supervisor command
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub sub: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Write the artifact and register it (Exit 0 = success, 1 = failed)
    Install,
    /// Unregister and delete the artifact (Exit 0 = success, 1 = failed)
    Uninstall,
    /// Restart the installed service (Exit 0 = success, 1 = failed)
    Restart,
    /// Show service state (Exit 0 = running, 1 = not running)
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the artifact that `install` would write, without writing it
    Render,
}
