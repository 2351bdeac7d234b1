//! The `run` command - starts a VM and waits for it to stop.

use super::open_manager;
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use velocity::{Manager, ManagerConfig, select_engine};

#[derive(Args)]
pub struct RunArgs {
    /// Name of the VM to run
    name: String,

    /// Write a PNG of the display here before stopping on Ctrl+C
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

pub async fn run(config: ManagerConfig, args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.bundle_dir.is_dir(),
        "bundle directory {} does not exist",
        config.bundle_dir.display()
    );

    let engine = select_engine()?;
    let manager = open_manager(config, Arc::from(engine)).await?;

    let vm = manager.start(&args.name).await?.wait().await?;
    eprintln!(
        "{} is running on {}. Press Ctrl+C to stop it.",
        vm.name(),
        manager.engine_name()
    );

    tokio::select! {
        state = manager.wait_for_exit(&args.name) => {
            eprintln!("{} exited: {:?}", args.name, state?);
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            if let Some(path) = &args.snapshot {
                save_snapshot(&manager, &args.name, path).await?;
            }
            eprintln!("Stopping {}...", args.name);
            let state = manager.stop(&args.name).await?.wait().await?;
            eprintln!("{} stopped: {:?}", args.name, state);
        }
    }

    Ok(())
}

async fn save_snapshot(manager: &Manager, name: &str, path: &Path) -> anyhow::Result<()> {
    match manager.snapshot(name).await? {
        Some(png) => {
            std::fs::write(path, png)
                .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
            info!(vm = %name, path = %path.display(), "saved snapshot");
        }
        None => eprintln!("No frame rendered yet, skipping snapshot."),
    }
    Ok(())
}
