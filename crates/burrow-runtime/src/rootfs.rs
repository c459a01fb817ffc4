//! Ephemeral root filesystem assembly.
//!
//! A [`RootFs`] owns one uniquely-named directory for the duration of a run.
//! It is populated in a fixed order: `/dev/null`, the target executable,
//! then every image layer in manifest order. [`RootFs::remove`] deletes it;
//! a guard dropped without removal falls back to a best-effort delete.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use burrow_common::constants::{ROOTFS_PREFIX, SEED_MODE};
use burrow_common::error::{BurrowError, Result};
use burrow_image::layer::{LayerUnpacker, stage_layer};
use burrow_image::registry::LayerBlob;

/// Exclusive owner of an ephemeral root directory.
#[derive(Debug)]
pub struct RootFs {
    path: PathBuf,
    removed: bool,
}

impl RootFs {
    /// Creates a fresh `burrow-*` directory under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::RootFs`] if the directory cannot be created.
    pub fn create(parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(ROOTFS_PREFIX)
            .tempdir_in(parent)
            .map_err(|e| BurrowError::RootFs {
                path: parent.to_path_buf(),
                source: e,
            })?;
        let path = dir.keep();
        tracing::info!(path = %path.display(), "root filesystem created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Host path of the root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates `/dev` and an empty regular `/dev/null`, both mode `0755`.
    ///
    /// `/dev/null` is a plain file, not a character device.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::RootFs`] on any I/O failure.
    pub fn seed_dev_null(&self) -> Result<()> {
        let dev = self.path.join("dev");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(SEED_MODE)
            .create(&dev)
            .map_err(|e| rootfs_err(&dev, e))?;

        let null = dev.join("null");
        let _file = fs::File::create(&null).map_err(|e| rootfs_err(&null, e))?;
        fs::set_permissions(&null, fs::Permissions::from_mode(SEED_MODE))
            .map_err(|e| rootfs_err(&null, e))?;
        Ok(())
    }

    /// Copies the host executable at `command` into the root at the same
    /// path and marks the copy `0755`. Returns the host path of the copy.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if `command` is not an absolute path
    /// and [`BurrowError::RootFs`] if the copy fails.
    pub fn install_executable(&self, command: &Path) -> Result<PathBuf> {
        let relative = mirrored_path(command)?;
        let target = self.path.join(&relative);

        if let Some(parent) = target.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(SEED_MODE)
                .create(parent)
                .map_err(|e| rootfs_err(parent, e))?;
        }
        let bytes = fs::copy(command, &target).map_err(|e| rootfs_err(command, e))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(SEED_MODE))
            .map_err(|e| rootfs_err(&target, e))?;

        tracing::debug!(
            source = %command.display(),
            target = %target.display(),
            bytes,
            "executable installed"
        );
        Ok(target)
    }

    /// Stages and unpacks every layer, strictly in the given order.
    ///
    /// Staging files are created in `staging_dir`, which must not be inside
    /// the root. Layers applied before a failure stay applied.
    ///
    /// # Errors
    ///
    /// Returns the first [`BurrowError::Extraction`].
    pub fn apply_layers(
        &self,
        layers: Vec<LayerBlob>,
        staging_dir: &Path,
        verify: bool,
        unpacker: &dyn LayerUnpacker,
    ) -> Result<()> {
        let total = layers.len();
        for (index, blob) in layers.into_iter().enumerate() {
            let staged = stage_layer(blob, staging_dir, verify)?;
            tracing::info!(
                digest = %staged.digest(),
                layer = index + 1,
                total,
                extractor = unpacker.name(),
                "applying layer"
            );
            unpacker.unpack(&staged, &self.path)?;
            staged.discard()?;
        }
        Ok(())
    }

    /// Recursively deletes the root directory.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Cleanup`] if the directory cannot be removed.
    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "root filesystem removed");
                Ok(())
            }
            Err(e) => Err(BurrowError::Cleanup {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

impl Drop for RootFs {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to remove abandoned root filesystem"
            );
        }
    }
}

/// Path of `command` relative to `/`, for joining onto the root.
fn mirrored_path(command: &Path) -> Result<PathBuf> {
    if !command.is_absolute() {
        return Err(BurrowError::Config {
            message: format!(
                "command must be an absolute path, got {}",
                command.display()
            ),
        });
    }
    let relative: PathBuf = command
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if relative.as_os_str().is_empty() || command.components().any(|c| c == Component::ParentDir) {
        return Err(BurrowError::Config {
            message: format!("command path {} does not name a file", command.display()),
        });
    }
    Ok(relative)
}

fn rootfs_err(path: &Path, source: std::io::Error) -> BurrowError {
    BurrowError::RootFs {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use burrow_image::layer::BuiltinUnpacker;
    use burrow_image::testing::{LayerEntry, gzip, tar_layer};

    use super::*;

    #[test]
    fn create_uses_prefix_and_remove_deletes() {
        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        let path = root.path().to_path_buf();

        assert!(path.is_dir());
        assert!(path.starts_with(parent.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(ROOTFS_PREFIX));

        root.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn two_roots_never_collide() {
        let parent = tempfile::tempdir().unwrap();
        let a = RootFs::create(parent.path()).unwrap();
        let b = RootFs::create(parent.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn create_in_missing_parent_is_rootfs_error() {
        let parent = tempfile::tempdir().unwrap();
        let err = RootFs::create(&parent.path().join("missing")).unwrap_err();
        assert!(matches!(err, BurrowError::RootFs { .. }));
    }

    #[test]
    fn drop_without_remove_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let root = RootFs::create(parent.path()).unwrap();
            root.seed_dev_null().unwrap();
            root.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn remove_of_vanished_root_is_cleanup_error() {
        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        fs::remove_dir_all(root.path()).unwrap();
        let err = root.remove().unwrap_err();
        assert!(matches!(err, BurrowError::Cleanup { .. }));
    }

    #[test]
    fn dev_null_is_empty_regular_file_with_seed_mode() {
        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        root.seed_dev_null().unwrap();

        let meta = fs::metadata(root.path().join("dev/null")).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        let dev = fs::metadata(root.path().join("dev")).unwrap();
        assert!(dev.is_dir());
    }

    #[test]
    fn executable_is_copied_to_mirrored_path() {
        let host = tempfile::tempdir().unwrap();
        let tool = host.path().join("opt/tools/hello");
        fs::create_dir_all(tool.parent().unwrap()).unwrap();
        fs::write(&tool, b"#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o600)).unwrap();

        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        let copy = root.install_executable(&tool).unwrap();

        let relative = tool.strip_prefix("/").unwrap();
        assert_eq!(copy, root.path().join(relative));
        assert_eq!(fs::read(&copy).unwrap(), fs::read(&tool).unwrap());
        assert_eq!(fs::metadata(&copy).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(fs::metadata(&tool).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn relative_command_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        let err = root.install_executable(Path::new("bin/ls")).unwrap_err();
        assert!(matches!(err, BurrowError::Config { .. }));
    }

    #[test]
    fn missing_host_executable_is_rootfs_error() {
        let parent = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();
        let err = root
            .install_executable(&parent.path().join("no-such-binary"))
            .unwrap_err();
        assert!(matches!(err, BurrowError::RootFs { .. }));
    }

    #[test]
    fn layers_apply_in_order_and_staging_is_cleared() {
        let parent = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let root = RootFs::create(parent.path()).unwrap();

        let layers: Vec<LayerBlob> = [
            gzip(&tar_layer(&[LayerEntry::file("etc/hostname", b"l0", 0o644)])),
            gzip(&tar_layer(&[LayerEntry::file("etc/hostname", b"l1", 0o644)])),
        ]
        .into_iter()
        .map(|bytes| {
            let descriptor = burrow_common::types::Descriptor {
                media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
                size: bytes.len() as u64,
                digest: burrow_image::hash::sha256_digest(&bytes).unwrap(),
            };
            LayerBlob::new(descriptor, std::io::Cursor::new(bytes))
        })
        .collect();

        root.apply_layers(layers, staging.path(), true, &BuiltinUnpacker::default())
            .unwrap();

        assert_eq!(fs::read_to_string(root.path().join("etc/hostname")).unwrap(), "l1");
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn mirrored_path_strips_root() {
        assert_eq!(
            mirrored_path(Path::new("/bin/ls")).unwrap(),
            PathBuf::from("bin/ls")
        );
        assert!(mirrored_path(Path::new("/")).is_err());
        assert!(mirrored_path(Path::new("/bin/../etc/passwd")).is_err());
    }
}
