use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use velocity_core::{
    EngineConfig, EngineHandle, Error, HypervisorEngine, ImageFormat, Result, StopReason,
};

/// EFI variable store kept inside each bundle, created on first boot.
const EFI_VARIABLE_STORE: &str = "efi-variable-store";

/// Runs each VM as a `vfkit` process.
pub struct VfkitEngine {
    vfkit_path: Option<PathBuf>,
}

impl VfkitEngine {
    pub fn new() -> Self {
        Self {
            vfkit_path: which::which("vfkit").ok(),
        }
    }

    fn build_args(config: &EngineConfig) -> Result<Vec<String>> {
        let properties = &config.properties;
        let efi_store = config.bundle_path().join(EFI_VARIABLE_STORE);

        let mut args = vec![
            "--cpus".to_string(),
            properties.resources.cpus.to_string(),
            "--memory".to_string(),
            properties.resources.memory_mb.to_string(),
            "--bootloader".to_string(),
            format!("efi,variable-store={},create", efi_store.display()),
        ];

        for (disk, path) in properties.disks.iter().zip(config.disk_paths()) {
            if disk.format != ImageFormat::Raw {
                return Err(Error::StartFailed(format!(
                    "vfkit only supports raw disk images: {}",
                    path.display()
                )));
            }
            args.push("--device".to_string());
            args.push(format!("virtio-blk,path={}", path.display()));
        }

        args.push("--device".to_string());
        args.push("virtio-net,nat".to_string());
        args.push("--device".to_string());
        args.push(format!(
            "virtio-gpu,width={},height={}",
            properties.screen_size.width, properties.screen_size.height
        ));
        args.push("--device".to_string());
        args.push("virtio-input,keyboard".to_string());

        Ok(args)
    }
}

impl Default for VfkitEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorEngine for VfkitEngine {
    fn name(&self) -> &'static str {
        "vfkit"
    }

    fn is_available(&self) -> bool {
        self.vfkit_path.is_some()
    }

    async fn instantiate(&self, config: &EngineConfig) -> Result<Box<dyn EngineHandle>> {
        let vfkit_path = self
            .vfkit_path
            .as_ref()
            .ok_or_else(|| Error::EngineUnavailable {
                name: "vfkit".to_string(),
                reason: "vfkit binary not found in PATH".to_string(),
            })?;

        let args = Self::build_args(config)?;

        tracing::debug!(vm = %config.name(), "starting vfkit with args: {:?}", args);

        let child = Command::new(vfkit_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StartFailed(format!("failed to spawn vfkit: {e}")))?;

        Ok(Box::new(VfkitVmHandle::new(child)))
    }
}

struct VfkitVmHandle {
    pid: Option<u32>,
    child: Mutex<Child>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl VfkitVmHandle {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
        }
    }

    // `wait` holds the child lock for the lifetime of the process, so signals
    // go through the pid captured at spawn time. Once the process is reaped
    // that pid may belong to something else.
    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::sys::signal;
        use nix::unistd::Pid;

        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pid = self
            .pid
            .ok_or_else(|| Error::Hypervisor("vfkit process has no pid".to_string()))?;
        signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::Hypervisor(format!("failed to signal vfkit: {e}")))
    }

    /// vfkit may exit on the SIGTERM we sent instead of waiting for the guest.
    fn terminated_on_request(&self, status: &std::process::ExitStatus) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            self.stop_requested.load(Ordering::SeqCst)
                && status.signal() == Some(nix::sys::signal::Signal::SIGTERM as i32)
        }
        #[cfg(not(unix))]
        {
            let _ = status;
            false
        }
    }
}

#[async_trait]
impl EngineHandle for VfkitVmHandle {
    async fn can_request_stop(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.pid.is_some()
    }

    async fn request_stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        {
            self.signal(nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            Err(Error::Hypervisor(
                "graceful stop is not supported on this platform".to_string(),
            ))
        }
    }

    async fn force_stop(&self) -> Result<()> {
        #[cfg(unix)]
        {
            self.signal(nix::sys::signal::Signal::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            self.child.lock().await.start_kill()?;
            Ok(())
        }
    }

    async fn wait(&self) -> Result<StopReason> {
        let mut child = self.child.lock().await;
        let status = child.wait().await?;
        self.running.store(false, Ordering::SeqCst);

        if status.success() || self.terminated_on_request(&status) {
            Ok(StopReason::GuestStopped)
        } else {
            Ok(StopReason::Error(format!("vfkit exited with {status}")))
        }
    }
}
