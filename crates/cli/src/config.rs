//! Loading [`ManagerConfig`] from an optional TOML file.

use anyhow::Context;
use std::path::{Path, PathBuf};
use velocity::ManagerConfig;

/// Reads `path` if given, then applies the command-line overrides.
pub fn load(path: Option<&Path>, bundle_dir: Option<PathBuf>) -> anyhow::Result<ManagerConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            parse(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => ManagerConfig::default(),
    };

    if let Some(bundle_dir) = bundle_dir {
        config.bundle_dir = bundle_dir;
    }

    config.validate()?;
    Ok(config)
}

fn parse(contents: &str) -> anyhow::Result<ManagerConfig> {
    Ok(toml::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn empty_file_uses_defaults() {
        assert_eq!(parse("").unwrap(), ManagerConfig::default());
    }

    #[test]
    fn parses_all_keys() {
        let config = parse(
            r#"
            bundle_dir = "/var/lib/velocity"
            stop_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.bundle_dir, PathBuf::from("/var/lib/velocity"));
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_value_types_are_rejected() {
        assert!(parse("stop_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn bundle_dir_flag_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("velocity.toml");
        std::fs::write(&path, "bundle_dir = \"from-file\"\nstop_timeout_secs = 7\n").unwrap();

        let config = load(Some(&path), Some(PathBuf::from("from-flag"))).unwrap();

        assert_eq!(config.bundle_dir, PathBuf::from("from-flag"));
        assert_eq!(config.stop_timeout_secs, 7);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("velocity.toml");
        std::fs::write(&path, "stop_timeout_secs = 0\n").unwrap();

        assert!(load(Some(&path), None).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/velocity.toml")), None).is_err());
    }
}
