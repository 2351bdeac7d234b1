use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk encoding of a VM disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
}

impl ImageFormat {
    /// `.raw`/`.img` are raw, `.qcow2` is qcow2. Case-insensitive.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "raw" | "img" => Some(Self::Raw),
            "qcow2" => Some(Self::Qcow2),
            _ => None,
        }
    }
}

/// A disk listed in a VM definition.
///
/// Relative paths live inside the bundle; see [`DiskImage::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskImage {
    pub path: PathBuf,
    #[serde(default)]
    pub format: ImageFormat,
}

impl<T: Into<PathBuf>> From<T> for DiskImage {
    fn from(path: T) -> Self {
        Self::new(path)
    }
}

impl DiskImage {
    /// Unknown extensions are treated as raw.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            format: ImageFormat::from_extension(&path).unwrap_or_default(),
            path,
        }
    }

    pub fn resolve(&self, bundle: &Path) -> PathBuf {
        match self.path.is_absolute() {
            true => self.path.clone(),
            false => bundle.join(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_map_to_formats() {
        let cases = [
            ("disk.raw", Some(ImageFormat::Raw)),
            ("disk.img", Some(ImageFormat::Raw)),
            ("disk.QCOW2", Some(ImageFormat::Qcow2)),
            ("disk.vmdk", None),
            ("disk", None),
        ];
        for (path, expected) in cases {
            assert_eq!(ImageFormat::from_extension(Path::new(path)), expected, "{path}");
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_raw() {
        assert_eq!(DiskImage::new("root.qcow2").format, ImageFormat::Qcow2);
        assert_eq!(DiskImage::new("root.bin").format, ImageFormat::Raw);
    }

    #[test]
    fn definition_may_omit_format() {
        let disk: DiskImage = serde_json::from_str(r#"{ "path": "disk.img" }"#).unwrap();
        assert_eq!(disk, DiskImage::new("disk.img"));
    }

    #[test]
    fn relative_paths_resolve_into_bundle() {
        let bundle = Path::new("/bundles/alpha");
        assert_eq!(
            DiskImage::new("disk.img").resolve(bundle),
            PathBuf::from("/bundles/alpha/disk.img")
        );
        assert_eq!(
            DiskImage::new("/srv/images/base.img").resolve(bundle),
            PathBuf::from("/srv/images/base.img")
        );
    }
}
