use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod render;

use commands::{
    run_install_command, run_refresh_command, run_remote_command, run_remove_command,
    run_search_command, run_status_command, run_update_command, Workspace,
};

#[derive(Parser, Debug)]
#[command(name = "bundlekit")]
#[command(about = "Install, update and remove application bundles", long_about = None)]
struct Cli {
    /// State directory; defaults to ~/.bundlekit.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Unattended run: scopes short on space are skipped instead of failing.
    #[arg(long, global = true)]
    background: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Status {
        ids: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Search {
        query: String,
    },
    Install {
        id: String,
    },
    Update {
        ids: Vec<String>,
    },
    Remove {
        id: String,
    },
    Refresh {
        remote: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum RemoteCommands {
    Add {
        name: String,
        url: String,
        #[arg(long, default_value = "user")]
        scope: String,
        #[arg(long, default_value_t = 10)]
        priority: u32,
    },
    Remove {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    Enable {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    Disable {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    run_cli(cli)
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("BUNDLEKIT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let mut workspace = Workspace::open(cli.root)?;

    match cli.command {
        Commands::Status { ids, json } => run_status_command(&mut workspace, &ids, json),
        Commands::Search { query } => run_search_command(&workspace, &query),
        Commands::Install { id } => run_install_command(&mut workspace, &id, cli.background),
        Commands::Update { ids } => run_update_command(&mut workspace, &ids, cli.background),
        Commands::Remove { id } => run_remove_command(&mut workspace, &id),
        Commands::Refresh { remote, scope } => run_refresh_command(&workspace, &scope, &remote),
        Commands::Remote { command } => run_remote_command(&mut workspace, command),
    }
}

#[cfg(test)]
mod tests;
