//! Global configuration: tool paths and default shell credentials.
//!
//! Loaded once at startup from a JSON file and read-only afterwards. Image
//! definition nodes inherit from these values unless they override them.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::errors::Error;

/// Locations of the external virtualization binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuPaths {
    /// Disk-image tool, e.g. `/usr/bin/qemu-img`.
    #[serde(rename = "qemu-img")]
    pub qemu_img: Utf8PathBuf,

    /// System emulator, e.g. `/usr/bin/qemu-system-x86_64`.
    #[serde(rename = "qemu-system")]
    pub qemu_system: Utf8PathBuf,
}

/// Tool-path settings. Overriding this anywhere replaces the whole
/// structure; individual fields are never merged across sources.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolPaths {
    pub qemu: QemuPaths,
}

/// Remote-shell credentials for provisioning sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    /// When false, sessions connect without credentials.
    pub required: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Process-wide defaults, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub paths: ToolPaths,
    pub auth: Auth,
}

impl GlobalConfig {
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        load_json_file(path)
    }
}

/// Read and deserialize a JSON file, classifying failures as
/// NotFound / Io / Parse with the offending path attached.
pub(crate) fn load_json_file<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<T, Error> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_owned()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| Error::Parse {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn write_config(dir: &tempfile::TempDir, name: &str, content: &str) -> Utf8PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn loads_well_formed_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "global.config.json",
            r#"{
                "paths": {
                    "qemu": {
                        "qemu-img": "/usr/bin/qemu-img",
                        "qemu-system": "/usr/bin/qemu-system-x86_64"
                    }
                },
                "auth": { "required": false, "user": "", "password": "" }
            }"#,
        );

        let config = GlobalConfig::load(&path).unwrap();
        assert_eq!(config.paths.qemu.qemu_img, "/usr/bin/qemu-img");
        assert_eq!(config.paths.qemu.qemu_system, "/usr/bin/qemu-system-x86_64");
        assert!(!config.auth.required);
    }

    #[test]
    fn auth_user_and_password_default_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "global.config.json",
            r#"{
                "paths": { "qemu": { "qemu-img": "img", "qemu-system": "sys" } },
                "auth": { "required": true }
            }"#,
        );

        let config = GlobalConfig::load(&path).unwrap();
        assert!(config.auth.required);
        assert!(config.auth.user.is_empty());
        assert!(config.auth.password.is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nope.json")).unwrap();
        let err = GlobalConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::NotFound(p) if p == path));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "broken.json", "{ not json");
        let err = GlobalConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { path: p, .. } if p == path));
    }

    #[test]
    fn wrong_shape_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "shape.json", r#"{ "paths": {} }"#);
        let err = GlobalConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
