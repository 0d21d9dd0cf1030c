//! Layer builder.
//!
//! Converts a resolved file tree into canonically ordered `FileEntry` values
//! and from those into one gzip-compressed tar layer per architecture.
//! Ownership is reset to root and only permission bits are kept; timestamps,
//! inode numbers and extended attributes of the source tree never reach the
//! archive.

use std::path::{Component, Path};

use stratum_core::error::{BuildError, Result};
use stratum_core::{Architecture, BuildTimestamp};
use walkdir::WalkDir;

use crate::archive::{
    ArchiveBlob, ArchiveFormat, ArchiveOptions, ArchiveWriter, Compression, EntryKind, EntryPath,
    FileEntry,
};
use crate::digest::ContentDigest;
use crate::oci::descriptor::{Descriptor, MEDIA_TYPE_LAYER_GZIP};

/// A compressed filesystem layer for one architecture.
#[derive(Debug, Clone)]
pub struct Layer {
    architecture: Architecture,
    blob: ArchiveBlob,
    diff_id: ContentDigest,
    media_type: &'static str,
}

impl Layer {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// The compressed layer bytes.
    pub fn blob(&self) -> &ArchiveBlob {
        &self.blob
    }

    /// Digest of the uncompressed tar stream.
    pub fn diff_id(&self) -> &ContentDigest {
        &self.diff_id
    }

    pub fn media_type(&self) -> &'static str {
        self.media_type
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(self.media_type, &self.blob)
    }
}

/// Builds layers from resolved file trees.
pub struct LayerBuilder;

impl LayerBuilder {
    /// Build the layer for `arch` from the tree rooted at `root`.
    pub fn build(root: &Path, arch: Architecture, build_date: &BuildTimestamp) -> Result<Layer> {
        let entries = Self::collect_entries(root)?;
        Self::from_entries(&entries, arch, build_date)
    }

    /// Build a layer from entries already in canonical order.
    pub fn from_entries(
        entries: &[FileEntry],
        arch: Architecture,
        build_date: &BuildTimestamp,
    ) -> Result<Layer> {
        let tar = ArchiveWriter::new(ArchiveOptions::new(
            ArchiveFormat::Tar,
            Compression::None,
            *build_date,
        ))
        .write(entries)?;
        let diff_id = tar.digest().clone();

        let blob = ArchiveWriter::new(ArchiveOptions::new(
            ArchiveFormat::Tar,
            Compression::Gzip,
            *build_date,
        ))
        .write(entries)?;

        tracing::info!(
            arch = %arch,
            entries = entries.len(),
            digest = %blob.digest(),
            diff_id = %diff_id,
            size = blob.size(),
            "Built layer"
        );

        Ok(Layer {
            architecture: arch,
            blob,
            diff_id,
            media_type: MEDIA_TYPE_LAYER_GZIP,
        })
    }

    /// Walk `root` and return its entries sorted by byte-wise path.
    pub fn collect_entries(root: &Path) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        for item in WalkDir::new(root).min_depth(1).follow_links(false) {
            let item = item.map_err(|e| {
                let context = format!("walking {}", root.display());
                match e.into_io_error() {
                    Some(io) => BuildError::io(context, io),
                    None => BuildError::ConfigurationError(format!("{}: filesystem loop", context)),
                }
            })?;

            let relative = item
                .path()
                .strip_prefix(root)
                .map_err(|_| BuildError::malformed(item.path().display().to_string(), "outside tree root"))?;
            let path = entry_path(relative)?;

            let metadata = item
                .path()
                .symlink_metadata()
                .map_err(|e| BuildError::io(format!("reading metadata of {}", item.path().display()), e))?;
            let file_type = metadata.file_type();

            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                let data = std::fs::read(item.path())
                    .map_err(|e| BuildError::io(format!("reading {}", item.path().display()), e))?;
                EntryKind::File(data.into())
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(item.path())
                    .map_err(|e| BuildError::io(format!("reading link {}", item.path().display()), e))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| BuildError::malformed(path.as_str(), "symlink target is not UTF-8"))?;
                EntryKind::Symlink(target.to_string())
            } else {
                tracing::warn!(path = %path, "Skipping special file");
                continue;
            };

            let mode = match kind {
                EntryKind::Symlink(_) => 0o777,
                _ => permission_bits(&metadata, file_type.is_dir()),
            };
            entries.push(FileEntry::new(path, mode, kind));
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!(root = %root.display(), entries = entries.len(), "Collected tree entries");
        Ok(entries)
    }
}

fn entry_path(relative: &Path) -> Result<EntryPath> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_str().ok_or_else(|| {
                BuildError::malformed(relative.display().to_string(), "path is not UTF-8")
            })?),
            _ => {
                return Err(BuildError::malformed(
                    relative.display().to_string(),
                    "unexpected path component",
                ))
            }
        }
    }
    EntryPath::new(&segments.join("/"))
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata, is_dir: bool) -> u32 {
    match (is_dir, metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}
