use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use filetime::FileTime;
use flist::FileEntry;

use crate::options::Options;

/// Whether this process may change file ownership.
pub fn am_root() -> bool {
    // SAFETY: geteuid has no failure modes and touches no memory
    unsafe { libc::geteuid() == 0 }
}

fn lchown(path: &Path, uid: i64, gid: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    // SAFETY: c_path is a valid NUL-terminated string for the call
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Applies the entry's metadata to `path`: mtime, ownership and
/// permission bits, each gated on its preserve flag. `current` avoids a
/// redundant stat when the caller already has one.
///
/// Per-file failures are reported as errors; callers log them and keep
/// going.
pub fn set_perms(
    path: &Path,
    entry: &FileEntry,
    current: Option<&fs::Metadata>,
    opts: &Options,
) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let owned;
    let meta = match current {
        Some(meta) => meta,
        None => {
            owned = fs::symlink_metadata(path)?;
            &owned
        }
    };

    let mut updated = false;
    let is_link = meta.file_type().is_symlink();

    if opts.preserve_times && !is_link && meta.mtime() != entry.modtime {
        filetime::set_file_mtime(path, FileTime::from_unix_time(entry.modtime, 0))?;
        updated = true;
    }

    let want_uid = opts.preserve_uid && am_root() && meta.uid() != entry.uid;
    let want_gid = opts.preserve_gid && meta.gid() != entry.gid;
    if want_uid || want_gid {
        lchown(
            path,
            if want_uid { i64::from(entry.uid) } else { -1 },
            if want_gid { i64::from(entry.gid) } else { -1 },
        )?;
        updated = true;
    }

    if opts.preserve_perms && !is_link && (meta.mode() & 0o7777) != (entry.mode & 0o7777) {
        fs::set_permissions(path, fs::Permissions::from_mode(entry.mode & 0o7777))?;
        updated = true;
    }

    Ok(updated)
}
