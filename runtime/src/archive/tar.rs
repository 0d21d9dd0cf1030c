//! Tar encoding.
//!
//! GNU headers with long-name extensions, owner/mode taken from the entry and
//! a single mtime. Duplicate content is written as hard-link entries.

use std::io::Write;

use ::tar::{Builder, EntryType, Header};
use stratum_core::error::{BuildError, Result};

use super::{EntryKind, FileEntry, LinkPlan};

pub(super) fn write<W: Write>(
    entries: &[FileEntry],
    plan: &LinkPlan,
    mtime: u64,
    sink: W,
) -> Result<W> {
    let mut builder = Builder::new(sink);

    for (i, entry) in entries.iter().enumerate() {
        let path = entry.path.as_str();
        let mut header = Header::new_gnu();
        header.set_mtime(mtime);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mode(entry.mode);

        let appended = match (&entry.kind, plan.link_target(i)) {
            (EntryKind::File(_), Some(target)) => {
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                builder.append_link(&mut header, path, entries[target].path.as_str())
            }
            (EntryKind::File(data), None) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, &data[..])
            }
            (EntryKind::Directory, _) => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", path), std::io::empty())
            }
            (EntryKind::Symlink(target), _) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, path, target)
            }
        };
        appended.map_err(|e| BuildError::io(format!("writing tar entry {}", path), e))?;
    }

    builder
        .into_inner()
        .map_err(|e| BuildError::io("finishing tar stream", e))
}
