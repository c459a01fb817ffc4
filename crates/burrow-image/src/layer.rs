//! Layer staging and unpacking.
//!
//! Each layer stream is first drained into a staging file next to the root
//! (never inside it), verified against its descriptor, and only then
//! unpacked. Layers must be applied strictly in manifest order: a later
//! layer overwrites or deletes files of an earlier one.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use burrow_common::config::{BurrowConfig, ExtractorKind};
use burrow_common::constants::STAGING_PREFIX;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::Digest;
use tempfile::NamedTempFile;

use crate::hash::HashingReader;
use crate::registry::LayerBlob;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Prefix marking a whiteout entry.
const WHITEOUT_PREFIX: &str = ".wh.";
/// Entry name marking an opaque directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Compression of a staged layer, detected from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed tar.
    None,
    /// Gzip-compressed tar.
    Gzip,
}

/// A layer blob persisted to a local staging file.
///
/// The staging file is deleted by [`StagedLayer::discard`], or on drop if
/// discard is never reached.
#[derive(Debug)]
pub struct StagedLayer {
    digest: Digest,
    file: NamedTempFile,
    size: u64,
    compression: Compression,
}

impl StagedLayer {
    /// Digest of the layer.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Path of the staging file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of bytes staged.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Detected compression.
    #[must_use]
    pub const fn compression(&self) -> Compression {
        self.compression
    }

    /// Removes the staging file.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Extraction`] if the file cannot be deleted.
    pub fn discard(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        self.file.close().map_err(|e| BurrowError::Extraction {
            digest: self.digest.to_string(),
            path,
            message: format!("failed to remove staging file: {e}"),
        })
    }
}

/// Drains `blob` into a staging file created in `staging_dir`.
///
/// The stream is consumed and closed whether staging succeeds or not. When
/// `verify` is set, the byte count and SHA-256 must match the descriptor.
///
/// # Errors
///
/// Returns [`BurrowError::Extraction`] if the staging file cannot be
/// created or written, the stream fails mid-read, verification fails, or
/// the layer uses an unsupported compression.
pub fn stage_layer(blob: LayerBlob, staging_dir: &Path, verify: bool) -> Result<StagedLayer> {
    let digest = blob.digest().clone();
    let declared_size = blob.declared_size();
    let extraction_err = |path: &Path, message: String| BurrowError::Extraction {
        digest: digest.to_string(),
        path: path.to_path_buf(),
        message,
    };

    let mut file = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tar")
        .tempfile_in(staging_dir)
        .map_err(|e| extraction_err(staging_dir, format!("failed to create staging file: {e}")))?;

    let mut reader = HashingReader::new(blob);
    let _copied = io::copy(&mut reader, file.as_file_mut())
        .map_err(|e| extraction_err(file.path(), format!("failed to drain layer stream: {e}")))?;
    let (actual, size) = reader.finish()?;

    if verify {
        if size != declared_size {
            return Err(extraction_err(
                file.path(),
                format!("size mismatch: manifest declares {declared_size} bytes, received {size}"),
            ));
        }
        if actual != digest {
            return Err(extraction_err(
                file.path(),
                format!("digest mismatch: received content hashes to {actual}"),
            ));
        }
    }

    let compression = detect_compression(file.as_file_mut())
        .map_err(|e| extraction_err(file.path(), e))?;

    tracing::debug!(
        digest = %digest,
        size,
        compression = ?compression,
        path = %file.path().display(),
        "layer staged"
    );

    Ok(StagedLayer {
        digest,
        file,
        size,
        compression,
    })
}

/// Sniffs the first bytes of the staged file.
fn detect_compression(file: &mut File) -> std::result::Result<Compression, String> {
    let mut magic = [0_u8; 4];
    let _start = file
        .seek(SeekFrom::Start(0))
        .map_err(|e| format!("failed to rewind staging file: {e}"))?;
    let mut filled = 0;
    while filled < magic.len() {
        let n = file
            .read(&mut magic[filled..])
            .map_err(|e| format!("failed to read staging file: {e}"))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled >= ZSTD_MAGIC.len() && magic == ZSTD_MAGIC {
        return Err("zstd-compressed layers are not supported".into());
    }
    if filled >= GZIP_MAGIC.len() && magic[..2] == GZIP_MAGIC {
        Ok(Compression::Gzip)
    } else {
        Ok(Compression::None)
    }
}

/// Strategy that applies a staged layer onto a root directory.
pub trait LayerUnpacker {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Unpacks `layer` into `root`, overwriting existing entries.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Extraction`] if unpacking fails. Entries
    /// applied before the failure stay in place.
    fn unpack(&self, layer: &StagedLayer, root: &Path) -> Result<()>;
}

/// Returns the unpacker selected by the configuration.
#[must_use]
pub fn unpacker_for(config: &BurrowConfig) -> Box<dyn LayerUnpacker> {
    match config.extractor {
        ExtractorKind::Tar => Box::new(ExternalTar::new(config.tar_program.clone())),
        ExtractorKind::Builtin => Box::new(BuiltinUnpacker::new()),
    }
}

/// Unpacks layers by invoking an external `tar` program.
#[derive(Debug, Clone)]
pub struct ExternalTar {
    program: PathBuf,
}

impl ExternalTar {
    /// Uses `program` (looked up in `PATH` when relative).
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LayerUnpacker for ExternalTar {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn unpack(&self, layer: &StagedLayer, root: &Path) -> Result<()> {
        let flags = match layer.compression() {
            Compression::Gzip => "-xzf",
            Compression::None => "-xf",
        };
        tracing::debug!(
            program = %self.program.display(),
            flags,
            archive = %layer.path().display(),
            root = %root.display(),
            "running external tar"
        );

        let output = Command::new(&self.program)
            .arg(flags)
            .arg(layer.path())
            .arg("-C")
            .arg(root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| BurrowError::Extraction {
                digest: layer.digest().to_string(),
                path: self.program.clone(),
                message: format!("failed to run tar: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BurrowError::Extraction {
                digest: layer.digest().to_string(),
                path: root.to_path_buf(),
                message: format!("tar {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Unpacks layers in-process with `tar` and `flate2`.
///
/// Unlike a plain `tar -x`, this applies OCI whiteouts: `.wh.<name>`
/// deletes `<name>` from the lower layers and `.wh..wh..opq` empties the
/// containing directory of lower-layer content. Entries that would land
/// outside the root are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinUnpacker {
    preserve_ownership: bool,
}

impl BuiltinUnpacker {
    /// Preserves file ownership only when running privileged, where
    /// `chown(2)` is allowed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            preserve_ownership: burrow_core::is_privileged(),
        }
    }

    /// Deletes what this layer's whiteouts hide in the lower layers.
    ///
    /// Runs as a separate pass before any entry of the layer is written, so
    /// a whiteout never removes a sibling from its own layer, wherever the
    /// marker sits in the archive.
    fn apply_whiteouts(reader: impl Read, root: &Path) -> io::Result<()> {
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let entry = entry?;
            match classify(&entry.path()?) {
                EntryAction::Opaque(dir) => {
                    if let Some(target) = resolve_inside(root, &dir) {
                        clear_directory(&target)?;
                    }
                }
                EntryAction::Remove(target) => {
                    if let Some(target) = resolve_inside(root, &target) {
                        remove_any(&target)?;
                    }
                }
                EntryAction::Unpack | EntryAction::Skip => {}
            }
        }
        Ok(())
    }

    fn apply_entries(&self, reader: impl Read, root: &Path, root_canonical: &Path) -> io::Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(self.preserve_ownership);
        archive.set_overwrite(true);
        archive.set_unpack_xattrs(false);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();

            match classify(&path) {
                EntryAction::Skip => {
                    tracing::warn!(entry = %path.display(), "skipping entry outside root");
                }
                EntryAction::Opaque(_) | EntryAction::Remove(_) => {}
                EntryAction::Unpack => {
                    if !entry.header().entry_type().is_dir() {
                        if let Some(existing) = resolve_inside(root_canonical, &path) {
                            replace_non_directory(&existing)?;
                        }
                    }
                    if !entry.unpack_in(root)? {
                        tracing::warn!(entry = %path.display(), "tar refused entry");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Opens the staged archive for one sequential read, decompressing as
/// needed.
fn open_archive(layer: &StagedLayer) -> io::Result<Box<dyn Read>> {
    let file = File::open(layer.path())?;
    Ok(match layer.compression() {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::None => Box::new(file),
    })
}

impl LayerUnpacker for BuiltinUnpacker {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn unpack(&self, layer: &StagedLayer, root: &Path) -> Result<()> {
        let extraction_err = |e: io::Error| BurrowError::Extraction {
            digest: layer.digest().to_string(),
            path: root.to_path_buf(),
            message: e.to_string(),
        };

        let root_canonical = root.canonicalize().map_err(extraction_err)?;
        open_archive(layer)
            .and_then(|archive| Self::apply_whiteouts(archive, &root_canonical))
            .and_then(|()| open_archive(layer))
            .and_then(|archive| self.apply_entries(archive, root, &root_canonical))
            .map_err(extraction_err)
    }
}

/// What to do with one archive entry.
#[derive(Debug, PartialEq, Eq)]
enum EntryAction {
    Unpack,
    Skip,
    /// Remove everything below this directory that came from lower layers.
    Opaque(PathBuf),
    /// Remove this path.
    Remove(PathBuf),
}

fn classify(path: &Path) -> EntryAction {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return EntryAction::Skip;
    }

    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return EntryAction::Unpack;
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

    if name == OPAQUE_WHITEOUT {
        EntryAction::Opaque(parent)
    } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
        EntryAction::Remove(parent.join(hidden))
    } else {
        EntryAction::Unpack
    }
}

/// Resolves `relative` below `root` without following a symlink out of it.
///
/// The parent directory is canonicalized and must stay below `root`; the
/// final component is not followed. Returns `None` if the parent does not
/// exist or escapes the root.
fn resolve_inside(root: &Path, relative: &Path) -> Option<PathBuf> {
    let joined = root.join(relative);
    let file_name = joined.file_name()?.to_os_string();
    let parent = joined.parent()?.canonicalize().ok()?;
    parent
        .starts_with(root)
        .then(|| parent.join(file_name))
}

fn clear_directory(dir: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return Ok(());
    }
    for child in std::fs::read_dir(dir)? {
        remove_any(&child?.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes an existing file or symlink so a later layer's entry replaces it
/// instead of writing through it.
fn replace_non_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => std::fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
