use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "refwatch",
    version,
    about = "Keeps game-asset references intact while files move on disk"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch a project tree and patch references in real time
    Watch {
        /// Project root directory
        root: PathBuf,

        #[command(flatten)]
        options: WatchArgs,
    },
    /// Build the reference index once and print summary statistics
    Scan {
        /// Project root directory
        root: PathBuf,

        /// Load options from a TOML config file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
pub struct WatchArgs {
    /// Load options from a TOML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log intended rewrites without touching disk or index
    #[arg(long)]
    pub dry_run: bool,

    /// Use the portable polling backend instead of the native one
    #[arg(long)]
    pub poll: bool,

    /// Do not expand texture renames to alias extensions
    #[arg(long)]
    pub no_texture_aliases: bool,

    /// Do not react to directory renames
    #[arg(long)]
    pub no_dir_renames: bool,

    /// Restrict reference matching to the exact renamed extension
    #[arg(long)]
    pub exact_extension: bool,

    /// Disable the Perforce checkout hook for read-only files
    #[arg(long)]
    pub no_vcs: bool,
}
