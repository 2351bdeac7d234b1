//! The `create` command - deploys a new VM bundle.

use super::open_manager;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use velocity::{ManagerConfig, ScreenSize, VfkitEngine, VmProperties};

const MAX_CPUS: u32 = 256;
const MAX_MEMORY_MB: u32 = 1024 * 1024; // 1 TB

#[derive(Args)]
pub struct CreateArgs {
    /// Name of the VM, also used as its bundle directory name
    #[arg(long)]
    name: String,

    /// Number of CPUs (1-256)
    #[arg(long, default_value = "1", value_parser = parse_cpus)]
    cpus: u32,

    /// Memory in MB (1-1048576)
    #[arg(long, default_value = "512", value_parser = parse_memory)]
    memory: u32,

    /// Screen width in pixels
    #[arg(long, default_value = "1280", value_parser = parse_dimension)]
    width: u32,

    /// Screen height in pixels
    #[arg(long, default_value = "800", value_parser = parse_dimension)]
    height: u32,

    /// Disk image, relative to the bundle or absolute (repeatable)
    #[arg(long)]
    disk: Vec<PathBuf>,
}

pub async fn run(config: ManagerConfig, args: CreateArgs) -> anyhow::Result<()> {
    let mut properties = VmProperties::new(args.name, ScreenSize::new(args.width, args.height))
        .with_resources(args.cpus, args.memory);
    for disk in args.disk {
        properties = properties.with_disk(disk);
    }

    let manager = open_manager(config, Arc::new(VfkitEngine::new())).await?;
    let vm = manager.create(properties).await?;

    println!(
        "Created {} in {}",
        vm.name(),
        velocity::store::bundle_path(&manager.config().bundle_dir, vm.name()).display()
    );
    Ok(())
}

fn parse_cpus(s: &str) -> Result<u32, String> {
    let cpus: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if cpus == 0 {
        return Err("cpus must be at least 1".to_string());
    }
    if cpus > MAX_CPUS {
        return Err(format!("cpus cannot exceed {MAX_CPUS}"));
    }
    Ok(cpus)
}

fn parse_memory(s: &str) -> Result<u32, String> {
    let memory: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if memory == 0 {
        return Err("memory must be at least 1 MB".to_string());
    }
    if memory > MAX_MEMORY_MB {
        return Err(format!("memory cannot exceed {MAX_MEMORY_MB} MB"));
    }
    Ok(memory)
}

fn parse_dimension(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(0) => Err("screen dimensions must be non-zero".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("'{s}' is not a valid number")),
    }
}
