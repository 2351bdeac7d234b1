//! VM definition store.
//!
//! A bundle directory holds one subdirectory per VM. A subdirectory is a VM
//! bundle if it contains a [`DEFINITION_FILE`]; anything else is ignored.
//!
//! ```text
//! bundles/
//! ├── alpha/
//! │   ├── Velocity.json
//! │   └── disk.img
//! └── scratch/          (no definition file, skipped)
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use velocity_core::{Error, Result, VmProperties};

pub const DEFINITION_FILE: &str = "Velocity.json";

pub fn bundle_path(bundle_dir: &Path, name: &str) -> PathBuf {
    bundle_dir.join(name)
}

pub fn definition_path(bundle: &Path) -> PathBuf {
    bundle.join(DEFINITION_FILE)
}

/// Loads every VM definition under `bundle_dir`.
///
/// Fails fast: one unreadable or malformed definition, or two bundles
/// declaring the same name, fails the whole scan and nothing is returned.
pub fn index(bundle_dir: &Path) -> Result<Vec<VmProperties>> {
    let index_error = |path: &Path, reason: String| Error::Index {
        path: path.to_path_buf(),
        reason,
    };

    let entries = fs::read_dir(bundle_dir).map_err(|e| index_error(bundle_dir, e.to_string()))?;

    let mut bundles = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| index_error(bundle_dir, e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            bundles.push(path);
        }
    }
    bundles.sort();

    let mut names = HashSet::new();
    let mut definitions = Vec::new();
    for bundle in bundles {
        let Some(properties) = load_definition(&bundle)? else {
            debug!(bundle = %bundle.display(), "no definition file, skipping");
            continue;
        };

        if !names.insert(properties.name.clone()) {
            return Err(Error::DuplicateName(properties.name));
        }

        info!(vm = %properties.name, bundle = %bundle.display(), "found VM");
        definitions.push(properties);
    }

    Ok(definitions)
}

/// Reads the definition file of one bundle, if it has one.
pub fn load_definition(bundle: &Path) -> Result<Option<VmProperties>> {
    let path = definition_path(bundle);
    if !path.is_file() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path).map_err(|e| Error::Index {
        path: path.clone(),
        reason: format!("could not read VM definition: {e}"),
    })?;

    let properties = serde_json::from_str(&contents).map_err(|e| Error::Index {
        path: path.clone(),
        reason: format!("malformed VM definition: {e}"),
    })?;

    Ok(Some(properties))
}

/// Creates a new bundle for `properties` and writes its definition file.
///
/// Nothing is left behind on failure.
pub fn deploy(bundle_dir: &Path, properties: &VmProperties) -> Result<PathBuf> {
    let deploy_error = |reason: String| Error::Deploy {
        name: properties.name.clone(),
        reason,
    };

    properties.validate().map_err(|e| deploy_error(e.to_string()))?;

    for disk in properties.disks.iter().filter(|d| d.path.is_absolute()) {
        if !disk.path.is_file() {
            return Err(deploy_error(format!(
                "disk image not found: {}",
                disk.path.display()
            )));
        }
    }

    fs::create_dir_all(bundle_dir).map_err(|e| {
        deploy_error(format!(
            "could not create bundle directory {}: {e}",
            bundle_dir.display()
        ))
    })?;

    let bundle = bundle_path(bundle_dir, &properties.name);
    fs::create_dir(&bundle).map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists => {
            deploy_error(format!("bundle {} already exists", bundle.display()))
        }
        _ => deploy_error(format!("could not create {}: {e}", bundle.display())),
    })?;

    if let Err(e) = write_definition(&bundle, properties) {
        if let Err(cleanup) = fs::remove_dir_all(&bundle) {
            tracing::warn!(
                bundle = %bundle.display(),
                error = %cleanup,
                "failed to clean up partially deployed bundle"
            );
        }
        return Err(deploy_error(e.to_string()));
    }

    info!(vm = %properties.name, bundle = %bundle.display(), "deployed VM bundle");
    Ok(bundle)
}

fn write_definition(bundle: &Path, properties: &VmProperties) -> Result<()> {
    let json = serde_json::to_string_pretty(properties)
        .map_err(|e| Error::InvalidConfig(format!("could not encode definition: {e}")))?;
    fs::write(definition_path(bundle), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use velocity_core::ScreenSize;

    fn props(name: &str) -> VmProperties {
        VmProperties::new(name, ScreenSize::new(1024, 768))
    }

    fn write_bundle(root: &Path, dir: &str, contents: Option<&str>) {
        let bundle = root.join(dir);
        fs::create_dir_all(&bundle).unwrap();
        if let Some(contents) = contents {
            fs::write(bundle.join(DEFINITION_FILE), contents).unwrap();
        }
    }

    fn definition(name: &str) -> String {
        serde_json::to_string(&props(name)).unwrap()
    }

    fn names(definitions: &[VmProperties]) -> Vec<&str> {
        definitions.iter().map(|p| p.name.as_str()).collect()
    }

    mod index {
        use super::*;

        #[test]
        fn skips_bundles_without_definition() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
            write_bundle(dir.path(), "beta", None);
            write_bundle(dir.path(), "gamma", Some(&definition("gamma")));

            let definitions = index(dir.path()).unwrap();
            assert_eq!(names(&definitions), vec!["alpha", "gamma"]);
        }

        #[test]
        fn ignores_plain_files() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
            fs::write(dir.path().join("notes.txt"), "hello").unwrap();

            assert_eq!(names(&index(dir.path()).unwrap()), vec!["alpha"]);
        }

        #[test]
        fn malformed_definition_fails_whole_scan() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
            write_bundle(dir.path(), "broken", Some("{ not json"));
            write_bundle(dir.path(), "gamma", Some(&definition("gamma")));

            match index(dir.path()) {
                Err(Error::Index { path, reason }) => {
                    assert!(path.ends_with("broken/Velocity.json"));
                    assert!(reason.contains("malformed"));
                }
                other => panic!("expected index error, got {other:?}"),
            }
        }

        #[test]
        fn duplicate_names_are_rejected() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "one", Some(&definition("alpha")));
            write_bundle(dir.path(), "two", Some(&definition("alpha")));

            assert!(matches!(
                index(dir.path()),
                Err(Error::DuplicateName(name)) if name == "alpha"
            ));
        }

        #[test]
        fn missing_bundle_dir_is_an_index_error() {
            let dir = TempDir::new().unwrap();
            let missing = dir.path().join("nope");
            assert!(matches!(index(&missing), Err(Error::Index { .. })));
        }

        #[test]
        fn repeated_scans_agree() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "gamma", Some(&definition("gamma")));
            write_bundle(dir.path(), "alpha", Some(&definition("alpha")));

            assert_eq!(index(dir.path()).unwrap(), index(dir.path()).unwrap());
        }
    }

    mod deploy {
        use super::*;

        #[test]
        fn writes_loadable_definition() {
            let dir = TempDir::new().unwrap();
            let properties = props("alpha").with_resources(2, 1024).with_disk("disk.img");

            let bundle = deploy(dir.path(), &properties).unwrap();

            assert_eq!(bundle, dir.path().join("alpha"));
            assert_eq!(load_definition(&bundle).unwrap(), Some(properties));
        }

        #[test]
        fn creates_missing_bundle_dir() {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("nested/bundles");
            deploy(&root, &props("alpha")).unwrap();
            assert!(definition_path(&root.join("alpha")).is_file());
        }

        #[test]
        fn existing_bundle_is_not_overwritten() {
            let dir = TempDir::new().unwrap();
            write_bundle(dir.path(), "alpha", Some("original"));

            let err = deploy(dir.path(), &props("alpha")).unwrap_err();
            assert!(matches!(err, Error::Deploy { .. }));
            let contents = fs::read_to_string(dir.path().join("alpha").join(DEFINITION_FILE));
            assert_eq!(contents.unwrap(), "original");
        }

        #[test]
        fn invalid_properties_leave_nothing_behind() {
            let dir = TempDir::new().unwrap();
            let err = deploy(dir.path(), &props("alpha").with_resources(0, 512)).unwrap_err();
            assert!(matches!(err, Error::Deploy { name, .. } if name == "alpha"));
            assert!(!dir.path().join("alpha").exists());
        }

        #[test]
        fn missing_absolute_disk_is_rejected() {
            let dir = TempDir::new().unwrap();
            let missing = dir.path().join("missing.img");
            let err = deploy(dir.path(), &props("alpha").with_disk(missing)).unwrap_err();
            assert!(err.to_string().contains("disk image not found"));
            assert!(!dir.path().join("alpha").exists());
        }
    }
}
