//! newc CPIO encoding.
//!
//! Inodes are numbered sequentially from 1 in output order. Hard-linked
//! entries share the inode of their first occurrence, which carries the data;
//! later links have size 0. This is the layout the kernel initramfs unpacker
//! resolves links from.

use std::io::Write;

use stratum_core::error::{BuildError, Result};

use super::{EntryKind, FileEntry, LinkPlan};

const MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";

const EMPTY: &[u8] = &[];

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

struct NewcHeader {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    filesize: u32,
}

pub(super) fn write<W: Write>(
    entries: &[FileEntry],
    plan: &LinkPlan,
    mtime: u64,
    mut sink: W,
) -> Result<W> {
    let mtime = narrow(TRAILER, "mtime", mtime)?;
    let mut inodes = vec![0u32; entries.len()];
    let mut next_ino = 1u32;
    let mut offset = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        let path = entry.path.as_str();
        let link = plan.link_target(i);
        inodes[i] = match link {
            Some(target) => inodes[target],
            None => {
                let ino = next_ino;
                next_ino += 1;
                ino
            }
        };

        let (file_type, nlink, data): (u32, u32, &[u8]) = match &entry.kind {
            EntryKind::File(_) if link.is_some() => (S_IFREG, plan.links(i), EMPTY),
            EntryKind::File(content) => (S_IFREG, plan.links(i), &content[..]),
            EntryKind::Directory => (S_IFDIR, 2, EMPTY),
            EntryKind::Symlink(target) => (S_IFLNK, 1, target.as_bytes()),
        };

        let header = NewcHeader {
            ino: inodes[i],
            mode: file_type | entry.mode,
            uid: narrow(path, "uid", entry.uid)?,
            gid: narrow(path, "gid", entry.gid)?,
            nlink,
            mtime,
            filesize: narrow(path, "size", data.len() as u64)?,
        };
        offset = write_member(&mut sink, offset, &header, path, data)
            .map_err(|e| BuildError::io(format!("writing cpio entry {}", path), e))?;
    }

    let trailer = NewcHeader {
        ino: 0,
        mode: 0,
        uid: 0,
        gid: 0,
        nlink: 1,
        mtime: 0,
        filesize: 0,
    };
    write_member(&mut sink, offset, &trailer, TRAILER, EMPTY)
        .map_err(|e| BuildError::io("writing cpio trailer", e))?;
    sink.flush()
        .map_err(|e| BuildError::io("flushing cpio stream", e))?;
    Ok(sink)
}

fn narrow(path: &str, field: &str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| BuildError::malformed(path, format!("{} {} exceeds the newc limit", field, value)))
}

/// Write one header, name and data; returns the new stream offset.
fn write_member<W: Write>(
    sink: &mut W,
    mut offset: u64,
    header: &NewcHeader,
    name: &str,
    data: &[u8],
) -> std::io::Result<u64> {
    let namesize = name.len() as u32 + 1;
    let encoded = format!(
        "{MAGIC}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
        header.ino,
        header.mode,
        header.uid,
        header.gid,
        header.nlink,
        header.mtime,
        header.filesize,
        0, // devmajor
        0, // devminor
        0, // rdevmajor
        0, // rdevminor
        namesize,
        0, // check
    );
    sink.write_all(encoded.as_bytes())?;
    sink.write_all(name.as_bytes())?;
    sink.write_all(&[0])?;
    offset += encoded.len() as u64 + namesize as u64;
    offset = pad(sink, offset)?;

    sink.write_all(data)?;
    offset += data.len() as u64;
    pad(sink, offset)
}

fn pad<W: Write>(sink: &mut W, offset: u64) -> std::io::Result<u64> {
    let padding = (4 - (offset % 4)) % 4;
    sink.write_all(&[0u8; 3][..padding as usize])?;
    Ok(offset + padding)
}
