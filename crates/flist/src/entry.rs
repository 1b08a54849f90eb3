use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::sync::Arc;

/// Wire flag bits of a file-list entry.
///
/// Apart from `DELETE`, these exist only inside the incremental wire
/// encoding; the in-memory entry keeps just the transfer-control bits.
pub mod flags {
    /// Entry is eligible for deletion sweeps on the receiving side.
    pub const DELETE: u8 = 1 << 0;
    /// Mode equals the previous entry's mode.
    pub const SAME_MODE: u8 = 1 << 1;
    /// Device number equals the previous entry's.
    pub const SAME_RDEV: u8 = 1 << 2;
    /// Owner equals the previous entry's.
    pub const SAME_UID: u8 = 1 << 3;
    /// Group equals the previous entry's.
    pub const SAME_GID: u8 = 1 << 4;
    /// Name shares a prefix with the previous entry's name.
    pub const SAME_NAME: u8 = 1 << 5;
    /// Name suffix length needs a full integer.
    pub const LONG_NAME: u8 = 1 << 6;
    /// Modification time equals the previous entry's.
    pub const SAME_TIME: u8 = 1 << 7;
}

/// Canonical wire representation of the symlink file type.
pub const WIRE_SYMLINK_TYPE: u32 = 0o120000;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFSOCK: u32 = 0o140000;
const S_IFIFO: u32 = 0o010000;

/// Maps a host mode to its wire form; the symlink type is pinned to
/// [`WIRE_SYMLINK_TYPE`] regardless of host conventions.
#[must_use]
pub fn to_wire_mode(mode: u32) -> u32 {
    if mode & S_IFMT == S_IFLNK {
        (mode & !S_IFMT) | WIRE_SYMLINK_TYPE
    } else {
        mode
    }
}

/// Maps a wire mode back to the host representation.
#[must_use]
pub fn from_wire_mode(mode: u32) -> u32 {
    if mode & S_IFMT == WIRE_SYMLINK_TYPE {
        (mode & !S_IFMT) | S_IFLNK
    } else {
        mode
    }
}

/// One path in the transfer.
#[derive(Clone, Debug, Default)]
pub struct FileEntry {
    /// Transfer-control flag bits ([`flags::DELETE`]).
    pub flags: u8,
    /// Modification time, signed seconds since the epoch.
    pub modtime: i64,
    /// File size in bytes.
    pub length: u64,
    /// File type and permission bits.
    pub mode: u32,
    /// Numeric owner id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Device number, meaningful only for device nodes.
    pub rdev: u32,
    /// Containing filesystem, for hardlink detection on regular files.
    pub dev: u64,
    /// Inode number, for hardlink detection on regular files.
    pub inode: u64,
    /// Final path component. Never empty and never contains `/`.
    pub basename: OsString,
    /// Parent directory, shared between entries of the same directory.
    pub dirname: Option<Arc<OsStr>>,
    /// Transfer-root prefix the sender opens this file under; never
    /// transmitted.
    pub basedir: Option<Arc<OsStr>>,
    /// Symlink target, present only for symlinks.
    pub link: Option<OsString>,
    /// Whole-file digest, present only in always-checksum mode.
    pub sum: Option<[u8; 16]>,
    /// Set during clean-up on the entry that lost a duplicate-path tie.
    /// Suppressed entries stay in place so indices keep their meaning.
    pub suppressed: bool,
}

impl FileEntry {
    /// Full transfer-relative name as raw bytes, `dirname/basename`.
    #[must_use]
    pub fn name_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(dir) = &self.dirname {
            out.extend_from_slice(dir.as_bytes());
            out.push(b'/');
        }
        out.extend_from_slice(self.basename.as_bytes());
        out
    }

    /// Full transfer-relative name as a path.
    #[must_use]
    pub fn name(&self) -> PathBuf {
        PathBuf::from(OsString::from_vec(self.name_bytes()))
    }

    /// Path the sender opens: `basedir/dirname/basename`.
    #[must_use]
    pub fn source_path(&self) -> PathBuf {
        match &self.basedir {
            Some(base) => PathBuf::from(base.as_ref()).join(self.name()),
            None => self.name(),
        }
    }

    /// Returns `true` for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Returns `true` for regular files.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Returns `true` for symlinks.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Returns `true` for character or block device nodes.
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFCHR | S_IFBLK | S_IFSOCK | S_IFIFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symlink_mode_is_canonical_on_the_wire() {
        let host = S_IFLNK | 0o777;
        assert_eq!(to_wire_mode(host) & S_IFMT, WIRE_SYMLINK_TYPE);
        assert_eq!(from_wire_mode(to_wire_mode(host)), host);
    }

    #[test]
    fn regular_modes_pass_through() {
        let mode = S_IFREG | 0o644;
        assert_eq!(to_wire_mode(mode), mode);
        assert_eq!(from_wire_mode(mode), mode);
    }

    #[test]
    fn name_joins_dirname_and_basename() {
        let entry = FileEntry {
            basename: OsString::from("file.txt"),
            dirname: Some(Arc::from(OsStr::new("some/dir"))),
            ..FileEntry::default()
        };
        assert_eq!(entry.name_bytes(), b"some/dir/file.txt");

        let bare = FileEntry {
            basename: OsString::from("top"),
            ..FileEntry::default()
        };
        assert_eq!(bare.name_bytes(), b"top");
    }

    #[test]
    fn type_predicates() {
        let dir = FileEntry { mode: S_IFDIR | 0o755, ..FileEntry::default() };
        assert!(dir.is_dir() && !dir.is_regular());

        let dev = FileEntry { mode: S_IFCHR | 0o600, ..FileEntry::default() };
        assert!(dev.is_device());

        let link = FileEntry { mode: S_IFLNK | 0o777, ..FileEntry::default() };
        assert!(link.is_symlink());
    }
}
