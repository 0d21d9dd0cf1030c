//! Archive writer.
//!
//! Turns an ordered list of `FileEntry` values into one deterministic archive
//! stream (tar or newc CPIO, optionally gzip-compressed). Every entry is
//! stamped with the configured build timestamp; uid/gid/mode come from the
//! entry itself. Identical regular-file content is stored once and later
//! occurrences are written as hard links.

mod cpio;
mod tar;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use flate2::GzBuilder;
use stratum_core::error::{BuildError, Result};
use stratum_core::BuildTimestamp;

use crate::digest::{Blob, ContentDigest};

/// Gzip level used for every compressed stream.
pub const GZIP_LEVEL: u32 = 6;

/// An immutable, finalized archive.
pub type ArchiveBlob = Blob;

/// A normalized, relative archive path.
///
/// Segments are joined with `/`; there is no leading `/` or `./`, and no
/// `.`/`..` segments. Ordering is byte-wise on the joined form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryPath(String);

impl EntryPath {
    pub fn new(path: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(BuildError::malformed(path, "path escapes the archive root"))
                }
                s if s.contains('\0') => {
                    return Err(BuildError::malformed(path, "path contains a NUL byte"))
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(BuildError::malformed(path, "empty path"));
        }
        Ok(EntryPath(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an entry holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File(Arc<[u8]>),
    Directory,
    Symlink(String),
}

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: EntryPath,
    /// Permission bits (`0o7777` mask); the file type comes from `kind`
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub kind: EntryKind,
}

impl FileEntry {
    pub fn file(path: &str, content: impl Into<Vec<u8>>, mode: u32) -> Result<Self> {
        Ok(Self::new(
            EntryPath::new(path)?,
            mode,
            EntryKind::File(Arc::from(content.into())),
        ))
    }

    pub fn directory(path: &str, mode: u32) -> Result<Self> {
        Ok(Self::new(EntryPath::new(path)?, mode, EntryKind::Directory))
    }

    pub fn symlink(path: &str, target: &str) -> Result<Self> {
        if target.is_empty() {
            return Err(BuildError::malformed(path, "empty symlink target"));
        }
        Ok(Self::new(
            EntryPath::new(path)?,
            0o777,
            EntryKind::Symlink(target.to_string()),
        ))
    }

    pub fn new(path: EntryPath, mode: u32, kind: EntryKind) -> Self {
        FileEntry {
            path,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            kind,
        }
    }

    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Content size; zero for directories, target length for symlinks.
    pub fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::File(data) => data.len() as u64,
            EntryKind::Directory => 0,
            EntryKind::Symlink(target) => target.len() as u64,
        }
    }
}

/// Container format of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    /// SVR4 "newc" CPIO, as read by the kernel initramfs loader
    Cpio,
}

/// Stream compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Fixed parameters of one archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    pub format: ArchiveFormat,
    pub compression: Compression,
    pub mtime: BuildTimestamp,
}

impl ArchiveOptions {
    pub fn new(format: ArchiveFormat, compression: Compression, mtime: BuildTimestamp) -> Self {
        Self {
            format,
            compression,
            mtime,
        }
    }
}

/// Hard-link grouping of duplicate file content.
///
/// `primary[i]` is the index of the first entry with identical content,
/// owner and mode, or `None` when entry `i` is stored in full.
#[derive(Debug)]
pub(crate) struct LinkPlan {
    primary: Vec<Option<usize>>,
    group_size: Vec<u32>,
}

impl LinkPlan {
    fn new(entries: &[FileEntry]) -> Self {
        let mut first_seen: HashMap<(ContentDigest, u32, u64, u64), usize> = HashMap::new();
        let mut primary = vec![None; entries.len()];
        let mut counts: HashMap<usize, u32> = HashMap::new();

        for (i, entry) in entries.iter().enumerate() {
            let EntryKind::File(data) = &entry.kind else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            let key = (ContentDigest::of(data), entry.mode, entry.uid, entry.gid);
            match first_seen.get(&key) {
                Some(&p) => {
                    primary[i] = Some(p);
                    *counts.entry(p).or_insert(1) += 1;
                }
                None => {
                    first_seen.insert(key, i);
                }
            }
        }

        let group_size = (0..entries.len())
            .map(|i| {
                let root = primary[i].unwrap_or(i);
                counts.get(&root).copied().unwrap_or(1)
            })
            .collect();

        LinkPlan {
            primary,
            group_size,
        }
    }

    /// Entry this one links to, if it is a duplicate.
    pub(crate) fn link_target(&self, index: usize) -> Option<usize> {
        self.primary[index]
    }

    /// Number of entries sharing this entry's content.
    pub(crate) fn links(&self, index: usize) -> u32 {
        self.group_size[index]
    }

    pub(crate) fn duplicates(&self) -> usize {
        self.primary.iter().filter(|p| p.is_some()).count()
    }
}

/// Writes deterministic archives.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveWriter {
    options: ArchiveOptions,
}

impl ArchiveWriter {
    pub fn new(options: ArchiveOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Write entries into an in-memory blob.
    pub fn write(&self, entries: &[FileEntry]) -> Result<ArchiveBlob> {
        let bytes = self.write_to(entries, Vec::new())?;
        Ok(Blob::new(bytes))
    }

    /// Stream entries, in the given order, into `sink`.
    pub fn write_to<W: Write>(&self, entries: &[FileEntry], sink: W) -> Result<W> {
        validate(entries)?;
        let plan = LinkPlan::new(entries);
        tracing::debug!(
            entries = entries.len(),
            hardlinks = plan.duplicates(),
            format = ?self.options.format,
            "Writing archive"
        );

        match self.options.compression {
            Compression::None => self.encode(entries, &plan, sink),
            Compression::Gzip => {
                let encoder = GzBuilder::new()
                    .mtime(0)
                    .write(sink, flate2::Compression::new(GZIP_LEVEL));
                let encoder = self.encode(entries, &plan, encoder)?;
                encoder
                    .finish()
                    .map_err(|e| BuildError::io("finishing gzip stream", e))
            }
        }
    }

    fn encode<W: Write>(&self, entries: &[FileEntry], plan: &LinkPlan, sink: W) -> Result<W> {
        let mtime = self.options.mtime.unix_seconds();
        match self.options.format {
            ArchiveFormat::Tar => self::tar::write(entries, plan, mtime, sink),
            ArchiveFormat::Cpio => self::cpio::write(entries, plan, mtime, sink),
        }
    }
}

fn validate(entries: &[FileEntry]) -> Result<()> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(&entry.path) {
            return Err(BuildError::malformed(
                entry.path.as_str(),
                "duplicate path in archive",
            ));
        }
    }
    Ok(())
}
