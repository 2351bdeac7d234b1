//! The `list` command - shows the VMs found in the bundle directory.

use super::open_manager;
use clap::Args;
use std::sync::Arc;
use velocity::{ManagerConfig, VfkitEngine, VirtualMachine};

#[derive(Args)]
pub struct ListArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

pub async fn run(config: ManagerConfig, args: ListArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.bundle_dir.is_dir(),
        "bundle directory {} does not exist",
        config.bundle_dir.display()
    );

    // Listing never boots anything, so any engine will do.
    let manager = open_manager(config, Arc::new(VfkitEngine::new())).await?;
    let vms = manager.list().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&vms)?);
    } else {
        print_text(&vms);
    }
    Ok(())
}

fn print_text(vms: &[VirtualMachine]) {
    if vms.is_empty() {
        println!("No VMs found.");
        return;
    }

    println!(
        "{:<24} {:>4} {:>8} {:>11}  {}",
        "NAME", "CPUS", "MEMORY", "SCREEN", "DISKS"
    );
    for vm in vms {
        let info = &vm.vm_info;
        println!(
            "{:<24} {:>4} {:>5} MB {:>11}  {}",
            info.name,
            info.resources.cpus,
            info.resources.memory_mb,
            format!("{}x{}", info.screen_size.width, info.screen_size.height),
            info.disks.len()
        );
    }
}
