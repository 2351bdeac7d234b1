mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "velocity")]
#[command(about = "Manage locally defined virtual machines")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the VM bundles (overrides the configuration file)
    #[arg(long, global = true)]
    bundle_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the VMs found in the bundle directory
    List(commands::list::ListArgs),

    /// Create a new VM bundle
    Create(commands::create::CreateArgs),

    /// Start a VM and wait for it to stop
    Run(commands::run::RunArgs),

    /// Show version information
    Version(commands::version::VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let Cli {
        config: config_path,
        bundle_dir,
        command,
    } = Cli::parse();
    let load_config = || config::load(config_path.as_deref(), bundle_dir.clone());

    match command {
        Commands::List(args) => commands::list::run(load_config()?, args).await,
        Commands::Create(args) => commands::create::run(load_config()?, args).await,
        Commands::Run(args) => commands::run::run(load_config()?, args).await,
        Commands::Version(args) => {
            commands::version::run(args);
            Ok(())
        }
    }
}
