//! Persisted "already installed" state for disk images.
//!
//! An install-mode boot is one-shot: once an image has been installed from
//! its ISO, later builds should boot the existing disk instead of attaching
//! the install medium again. A sidecar JSON file next to the disk records a
//! hash of the install inputs; installation re-arms automatically when the
//! inputs change (different ISO, different creation size).
//!
//! Marker writes are best-effort. A build whose install launched fine is not
//! failed just because the marker could not be written; the worst case is a
//! repeated install prompt on the next run.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::image::Image;

/// Marker format version, bumped on incompatible changes.
const MARKER_VERSION: u32 = 1;

/// Inputs that determine whether a recorded install still covers the
/// current definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstallInputs {
    iso: String,
    disk_file: String,
    init_size_gb: u32,
    version: u32,
}

impl InstallInputs {
    fn hash(&self) -> String {
        let json = serde_json::to_string(self).expect("install inputs serialize");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// On-disk marker contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallMarker {
    iso: String,
    disk_file: String,
    init_size_gb: u32,
    version: u32,
    install_hash: String,
}

impl InstallMarker {
    fn new(image: &Image, iso: &Utf8Path, disk_file: &str) -> Self {
        let inputs = InstallInputs {
            iso: iso.to_string(),
            disk_file: disk_file.to_string(),
            init_size_gb: image.init_size_gb,
            version: MARKER_VERSION,
        };
        let install_hash = inputs.hash();
        InstallMarker {
            iso: inputs.iso,
            disk_file: inputs.disk_file,
            init_size_gb: inputs.init_size_gb,
            version: inputs.version,
            install_hash,
        }
    }

    fn expected_hash(&self) -> String {
        InstallInputs {
            iso: self.iso.clone(),
            disk_file: self.disk_file.clone(),
            init_size_gb: self.init_size_gb,
            version: self.version,
        }
        .hash()
    }
}

/// Sidecar path for a disk file, e.g. `base.qcow.installed.json`.
pub fn marker_path(base_dir: &Utf8Path, disk_file: &str) -> Utf8PathBuf {
    base_dir.join(format!("{disk_file}.installed.json"))
}

/// Whether an install-mode boot is still needed for this image. True when
/// no marker exists or the recorded install no longer matches the current
/// inputs.
pub fn needs_install(image: &Image, iso: &Utf8Path, disk_file: &str, base_dir: &Utf8Path) -> bool {
    let path = marker_path(base_dir, disk_file);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            debug!("no install marker at {path}");
            return true;
        }
    };
    let marker: InstallMarker = match serde_json::from_str(&raw) {
        Ok(marker) => marker,
        Err(err) => {
            debug!("unreadable install marker at {path}: {err}");
            return true;
        }
    };

    let expected = InstallMarker::new(image, iso, disk_file);
    if marker.install_hash != marker.expected_hash() {
        debug!("install marker at {path} is internally inconsistent");
        return true;
    }
    if marker.install_hash != expected.install_hash {
        debug!(
            "install inputs changed for {disk_file} (recorded {}, expected {})",
            marker.install_hash, expected.install_hash
        );
        return true;
    }
    false
}

/// Record a successful install launch. Failures are logged and swallowed.
pub fn record_install(image: &Image, iso: &Utf8Path, disk_file: &str, base_dir: &Utf8Path) {
    let path = marker_path(base_dir, disk_file);
    let marker = InstallMarker::new(image, iso, disk_file);
    let json = match serde_json::to_string_pretty(&marker) {
        Ok(json) => json,
        Err(err) => {
            debug!("failed to serialize install marker for {disk_file}: {err}");
            return;
        }
    };
    if let Err(err) = std::fs::write(&path, json) {
        debug!("failed to write install marker {path}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::image::ImageJson;
    use serde_json::json;

    fn image(value: serde_json::Value) -> Image {
        let global: GlobalConfig = serde_json::from_value(json!({
            "paths": { "qemu": { "qemu-img": "img", "qemu-system": "sys" } },
            "auth": { "required": false, "user": "", "password": "" }
        }))
        .unwrap();
        let json: ImageJson = serde_json::from_value(value).unwrap();
        Image::from_json(json, &global).unwrap()
    }

    fn tmp_base() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, base)
    }

    #[test]
    fn fresh_image_needs_install() {
        let (_dir, base) = tmp_base();
        let img = image(json!({ "id": "base", "iso": "arch.iso" }));
        assert!(needs_install(
            &img,
            Utf8Path::new("/isos/arch.iso"),
            "base.qcow",
            &base
        ));
    }

    #[test]
    fn recorded_install_suppresses_reinstall() {
        let (_dir, base) = tmp_base();
        let img = image(json!({ "id": "base", "iso": "arch.iso", "initSizeGB": 8 }));
        let iso = Utf8Path::new("/isos/arch.iso");

        record_install(&img, iso, "base.qcow", &base);
        assert!(marker_path(&base, "base.qcow").exists());
        assert!(!needs_install(&img, iso, "base.qcow", &base));
    }

    #[test]
    fn changed_iso_rearms_install() {
        let (_dir, base) = tmp_base();
        let img = image(json!({ "id": "base", "iso": "arch.iso" }));

        record_install(&img, Utf8Path::new("/isos/arch-2024.iso"), "base.qcow", &base);
        assert!(needs_install(
            &img,
            Utf8Path::new("/isos/arch-2025.iso"),
            "base.qcow",
            &base
        ));
    }

    #[test]
    fn changed_disk_size_rearms_install() {
        let (_dir, base) = tmp_base();
        let iso = Utf8Path::new("/isos/arch.iso");

        let small = image(json!({ "id": "base", "iso": "arch.iso", "initSizeGB": 4 }));
        record_install(&small, iso, "base.qcow", &base);

        let grown = image(json!({ "id": "base", "iso": "arch.iso", "initSizeGB": 16 }));
        assert!(needs_install(&grown, iso, "base.qcow", &base));
    }

    #[test]
    fn corrupt_marker_rearms_install() {
        let (_dir, base) = tmp_base();
        let img = image(json!({ "id": "base", "iso": "arch.iso" }));
        std::fs::write(marker_path(&base, "base.qcow"), "not json").unwrap();
        assert!(needs_install(
            &img,
            Utf8Path::new("/isos/arch.iso"),
            "base.qcow",
            &base
        ));
    }

    #[test]
    fn tampered_marker_hash_rearms_install() {
        let (_dir, base) = tmp_base();
        let img = image(json!({ "id": "base", "iso": "arch.iso" }));
        let iso = Utf8Path::new("/isos/arch.iso");

        record_install(&img, iso, "base.qcow", &base);
        let path = marker_path(&base, "base.qcow");
        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("sha256:", "sha256:00");
        std::fs::write(&path, tampered).unwrap();

        assert!(needs_install(&img, iso, "base.qcow", &base));
    }
}
