// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C-compatible argument and result layouts

use libc::c_int;
use threadfs_core::{Attributes, DirEntry, FileType, OpenFlags, Usage, Whence};

/// Device number reported for every node.
pub const DEVICE_ID: u64 = 1;
pub const BLOCK_SIZE: i64 = 4096;

/// Result of `stat`, `lstat` and `fstat`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: i64,
    pub st_blksize: i64,
    /// 512-byte blocks
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_mtime: i64,
    pub st_ctime: i64,
}

fn type_bits(file_type: FileType) -> u32 {
    let bits = match file_type {
        FileType::RegularFile => libc::S_IFREG,
        FileType::Directory => libc::S_IFDIR,
        FileType::Symlink => libc::S_IFLNK,
    };
    bits as u32
}

impl From<&Attributes> for Stat {
    fn from(attrs: &Attributes) -> Self {
        let size = i64::try_from(attrs.size).unwrap_or(i64::MAX);
        Self {
            st_dev: DEVICE_ID,
            st_ino: attrs.id.0,
            st_mode: type_bits(attrs.file_type) | (attrs.mode & 0o7777),
            st_nlink: attrs.nlink,
            st_uid: attrs.uid,
            st_gid: attrs.gid,
            st_size: size,
            st_blksize: BLOCK_SIZE,
            st_blocks: (size + 511) / 512,
            st_atime: attrs.times.atime,
            st_mtime: attrs.times.mtime,
            st_ctime: attrs.times.ctime,
        }
    }
}

/// `f_type` reported by `statfs`.
pub const FS_MAGIC: i64 = 0x7468_6673;
/// Longest name `statfs` advertises. Names are not limited beyond this.
pub const NAME_MAX: i64 = 255;
/// The store has no fixed capacity, so free blocks and nodes are nominal.
pub const FREE_BLOCKS: u64 = 1 << 32;
pub const FREE_NODES: u64 = 1 << 32;

/// Result of `statfs` and `fstatfs`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statfs {
    pub f_type: i64,
    pub f_bsize: i64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_namelen: i64,
    pub f_frsize: i64,
}

impl From<Usage> for Statfs {
    fn from(usage: Usage) -> Self {
        let used = usage.bytes.div_ceil(BLOCK_SIZE as u64);
        Self {
            f_type: FS_MAGIC,
            f_bsize: BLOCK_SIZE,
            f_blocks: used + FREE_BLOCKS,
            f_bfree: FREE_BLOCKS,
            f_bavail: FREE_BLOCKS,
            f_files: usage.nodes + FREE_NODES,
            f_ffree: FREE_NODES,
            f_namelen: NAME_MAX,
            f_frsize: BLOCK_SIZE,
        }
    }
}

/// Argument of `utime`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UtimBuf {
    pub actime: i64,
    pub modtime: i64,
}

/// Decode `open(2)` flags. `None` for an invalid access mode.
pub fn open_flags(flags: c_int) -> Option<OpenFlags> {
    let (read, write) = match flags & libc::O_ACCMODE {
        libc::O_RDONLY => (true, false),
        libc::O_WRONLY => (false, true),
        libc::O_RDWR => (true, true),
        _ => return None,
    };
    Some(OpenFlags {
        read,
        write,
        create: flags & libc::O_CREAT != 0,
        exclusive: flags & libc::O_EXCL != 0,
        truncate: flags & libc::O_TRUNC != 0,
        append: flags & libc::O_APPEND != 0,
        directory: flags & libc::O_DIRECTORY != 0,
        nofollow: flags & libc::O_NOFOLLOW != 0,
    })
}

/// `F_GETFL` value for a handle: the access mode and `O_APPEND`.
pub fn status_flags(flags: OpenFlags) -> c_int {
    let mode = match (flags.read, flags.write) {
        (_, false) => libc::O_RDONLY,
        (false, true) => libc::O_WRONLY,
        (true, true) => libc::O_RDWR,
    };
    if flags.append {
        mode | libc::O_APPEND
    } else {
        mode
    }
}

pub fn whence(value: c_int) -> Option<Whence> {
    match value {
        libc::SEEK_SET => Some(Whence::Set),
        libc::SEEK_CUR => Some(Whence::Current),
        libc::SEEK_END => Some(Whence::End),
        _ => None,
    }
}

// struct linux_dirent64: d_ino, d_off, d_reclen, d_type, then the name.
const DIRENT_HEADER: usize = 19;

fn dirent_type(file_type: FileType) -> u8 {
    match file_type {
        FileType::RegularFile => libc::DT_REG,
        FileType::Directory => libc::DT_DIR,
        FileType::Symlink => libc::DT_LNK,
    }
}

/// Size of the record for an entry, NUL included, padded to 8 bytes.
pub fn dirent_len(entry: &DirEntry) -> usize {
    (DIRENT_HEADER + entry.name.len() + 1 + 7) & !7
}

/// Pack as many entries as fit into `buf` in `linux_dirent64` layout.
/// `first_offset` is the directory position of `entries[0]`. Returns the
/// number of bytes used and of entries packed.
pub fn pack_dirents(entries: &[DirEntry], first_offset: u64, buf: &mut [u8]) -> (usize, usize) {
    let mut used = 0;
    let mut packed = 0;
    for entry in entries {
        let len = dirent_len(entry);
        if used + len > buf.len() {
            break;
        }
        let record = &mut buf[used..used + len];
        record.fill(0);
        let next = first_offset + packed as u64 + 1;
        record[0..8].copy_from_slice(&entry.id.0.to_ne_bytes());
        record[8..16].copy_from_slice(&(next as i64).to_ne_bytes());
        record[16..18].copy_from_slice(&(len as u16).to_ne_bytes());
        record[18] = dirent_type(entry.file_type);
        record[DIRENT_HEADER..DIRENT_HEADER + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        used += len;
        packed += 1;
    }
    (used, packed)
}

/// Entries decoded from a `getdents` buffer: (inode, type, name).
pub fn unpack_dirents(buf: &[u8]) -> Vec<(u64, u8, String)> {
    let mut out = Vec::new();
    let mut at = 0;
    while at + DIRENT_HEADER <= buf.len() {
        let mut ino = [0u8; 8];
        ino.copy_from_slice(&buf[at..at + 8]);
        let reclen = u16::from_ne_bytes([buf[at + 16], buf[at + 17]]) as usize;
        if reclen == 0 || at + reclen > buf.len() {
            break;
        }
        let name = &buf[at + DIRENT_HEADER..at + reclen];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        out.push((
            u64::from_ne_bytes(ino),
            buf[at + 18],
            String::from_utf8_lossy(&name[..end]).into_owned(),
        ));
        at += reclen;
    }
    out
}
