mod disk;
mod state;

pub use disk::{DiskImage, ImageFormat};
pub use state::{VirtualMachine, VmState};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub cpus: u32,
    pub memory_mb: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 512,
        }
    }
}

/// Framebuffer geometry of a VM's display, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Declarative definition of a VM, as stored in its bundle's definition file.
///
/// The name is the VM's unique key. Properties are loaded once and never
/// mutated afterwards; running instances share them read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProperties {
    pub name: String,
    pub screen_size: ScreenSize,
    #[serde(flatten)]
    pub resources: ResourceConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskImage>,
}

impl VmProperties {
    pub fn new(name: impl Into<String>, screen_size: ScreenSize) -> Self {
        Self {
            name: name.into(),
            screen_size,
            resources: ResourceConfig::default(),
            disks: Vec::new(),
        }
    }

    pub fn with_resources(mut self, cpus: u32, memory_mb: u32) -> Self {
        self.resources = ResourceConfig { cpus, memory_mb };
        self
    }

    pub fn with_disk(mut self, disk: impl Into<DiskImage>) -> Self {
        self.disks.push(disk.into());
        self
    }

    /// Checks that the definition can be deployed and booted.
    ///
    /// The name doubles as the bundle directory name, so it must be a single
    /// normal path component.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("VM name cannot be empty".into()));
        }

        let mut components = Path::new(&self.name).components();
        let single_normal = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !single_normal || self.name.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!(
                "VM name '{}' is not a valid bundle name",
                self.name
            )));
        }

        if self.resources.cpus == 0 {
            return Err(Error::InvalidConfig("cpus must be at least 1".into()));
        }
        if self.resources.memory_mb == 0 {
            return Err(Error::InvalidConfig("memory must be at least 1 MB".into()));
        }
        if self.screen_size.width == 0 || self.screen_size.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "screen size {}x{} is empty",
                self.screen_size.width, self.screen_size.height
            )));
        }

        Ok(())
    }

    /// Disk paths with relative entries resolved against `bundle`.
    pub fn disk_paths(&self, bundle: &Path) -> Vec<PathBuf> {
        self.disks
            .iter()
            .map(|disk| disk.resolve(bundle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(name: &str) -> VmProperties {
        VmProperties::new(name, ScreenSize::new(1024, 768))
    }

    mod resource_config {
        use super::*;

        #[test]
        fn default_values() {
            let config = ResourceConfig::default();
            assert_eq!(config.cpus, 1);
            assert_eq!(config.memory_mb, 512);
        }
    }

    mod vm_properties {
        use super::*;

        #[test]
        fn decodes_definition_file() {
            let json = r#"{
                "name": "alpha",
                "screen_size": { "width": 1920, "height": 1080 },
                "cpus": 4,
                "memory_mb": 4096,
                "disks": [{ "path": "disk.img", "format": "raw" }]
            }"#;
            let props: VmProperties = serde_json::from_str(json).unwrap();
            assert_eq!(props.name, "alpha");
            assert_eq!(props.screen_size, ScreenSize::new(1920, 1080));
            assert_eq!(props.resources.cpus, 4);
            assert_eq!(props.resources.memory_mb, 4096);
            assert_eq!(props.disks.len(), 1);
        }

        #[test]
        fn resources_default_when_omitted() {
            let json = r#"{ "name": "alpha", "screen_size": { "width": 800, "height": 600 } }"#;
            let props: VmProperties = serde_json::from_str(json).unwrap();
            assert_eq!(props.resources, ResourceConfig::default());
            assert!(props.disks.is_empty());
        }

        #[test]
        fn missing_screen_size_is_rejected() {
            let json = r#"{ "name": "alpha" }"#;
            assert!(serde_json::from_str::<VmProperties>(json).is_err());
        }

        #[test]
        fn validate_accepts_reasonable_definition() {
            assert!(props("alpha").with_resources(2, 2048).validate().is_ok());
        }

        #[test]
        fn validate_rejects_bad_names() {
            for name in ["", "  ", ".", "..", "a/b", "../escape", "a\\b"] {
                assert!(
                    matches!(props(name).validate(), Err(Error::InvalidConfig(_))),
                    "name {name:?} should be rejected"
                );
            }
        }

        #[test]
        fn validate_rejects_zero_resources() {
            assert!(props("alpha").with_resources(0, 512).validate().is_err());
            assert!(props("alpha").with_resources(1, 0).validate().is_err());
        }

        #[test]
        fn validate_rejects_empty_screen() {
            let props = VmProperties::new("alpha", ScreenSize::new(0, 768));
            assert!(props.validate().is_err());
        }

        #[test]
        fn disk_paths_resolve_relative_to_bundle() {
            let props = props("alpha")
                .with_disk("disk.img")
                .with_disk("/images/shared.qcow2");
            let paths = props.disk_paths(Path::new("/bundles/alpha"));
            assert_eq!(
                paths,
                vec![
                    PathBuf::from("/bundles/alpha/disk.img"),
                    PathBuf::from("/images/shared.qcow2"),
                ]
            );
        }
    }
}
