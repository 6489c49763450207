//! SFTP data types

use serde::{Deserialize, Serialize};

/// Largest payload carried by a single READ or WRITE request
pub const MAX_TRANSFER_CHUNK: usize = 16 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// File open flags (`SSH_FXF_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const APPEND: OpenFlags = OpenFlags(0x04);
    pub const CREATE: OpenFlags = OpenFlags(0x08);
    pub const TRUNCATE: OpenFlags = OpenFlags(0x10);
    pub const EXCLUDE: OpenFlags = OpenFlags(0x20);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        OpenFlags(bits)
    }

    pub const fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// File attributes as carried on the wire. Absent fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Mode bits including the file type (`st_mode`)
    pub permissions: Option<u32>,
    /// Last access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Last modified time (Unix timestamp)
    pub mtime: Option<u32>,
}

impl FileAttributes {
    /// Attributes carrying only a permission mode
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        match self.permissions.map(|mode| mode & S_IFMT) {
            Some(S_IFDIR) => FileType::Directory,
            Some(S_IFREG) => FileType::File,
            Some(S_IFLNK) => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    /// Symbolic mode string, e.g. `drwxr-xr-x`
    pub fn permission_string(&self) -> String {
        let mode = self.permissions.unwrap_or(0);
        let mut out = String::with_capacity(10);
        out.push(self.file_type().letter());
        for shift in [6, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl FileType {
    /// Type letter used by `ls -l`
    pub fn letter(&self) -> char {
        match self {
            FileType::File => '-',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::Unknown => '?',
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name (not full path)
    pub filename: String,
    /// Server-formatted `ls -l` line
    pub longname: String,
    pub attrs: FileAttributes,
}

impl DirEntry {
    pub fn file_type(&self) -> FileType {
        self.attrs.file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn size(&self) -> u64 {
        self.attrs.size.unwrap_or(0)
    }
}

/// Per-entry verdict from a directory listing filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilterAction {
    /// Keep the entry and continue
    Add,
    /// Drop the entry and continue
    Ignore,
    /// Stop listing; entries kept so far are returned
    Cancel,
}
