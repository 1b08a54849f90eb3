use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use protocol::wire::{ReadWire, WriteWire};
use protocol::{MAXPATHLEN, SUM_LENGTH};

use crate::entry::{flags, from_wire_mode, to_wire_mode, FileEntry};
use crate::list::{clean_path, sanitize_path, FileList};

/// Wire-relevant option subset shared by both codec directions.
///
/// Both peers must agree on every field here; they decide which optional
/// fields appear in each entry.
#[derive(Clone, Copy, Debug)]
pub struct CodecOptions {
    /// Negotiated protocol version.
    pub protocol: i32,
    /// Owner ids travel with each entry.
    pub preserve_uid: bool,
    /// Group ids travel with each entry.
    pub preserve_gid: bool,
    /// Device numbers travel with device entries.
    pub preserve_devices: bool,
    /// Symlink targets travel with symlink entries.
    pub preserve_links: bool,
    /// dev/inode pairs travel with regular entries.
    pub preserve_hard_links: bool,
    /// Whole-file digests travel with each entry.
    pub always_checksum: bool,
    /// Harden received paths against escaping the destination root.
    pub sanitize_paths: bool,
    /// Strip the leading `/` from received directory names.
    pub strip_root: bool,
}

impl CodecOptions {
    /// Minimal option set for the given protocol version.
    #[must_use]
    pub fn new(protocol: i32) -> Self {
        Self {
            protocol,
            preserve_uid: false,
            preserve_gid: false,
            preserve_devices: false,
            preserve_links: false,
            preserve_hard_links: false,
            always_checksum: false,
            sanitize_paths: false,
            strip_root: false,
        }
    }

    fn checksum_len(&self) -> usize {
        if self.protocol < 21 {
            2
        } else {
            SUM_LENGTH
        }
    }
}

/// Sender-side incremental state: the previous entry's fields, which the
/// wire encoding deltas against.
#[derive(Clone, Debug, Default)]
pub struct SendState {
    last_time: i64,
    last_mode: u32,
    last_rdev: u32,
    last_uid: u32,
    last_gid: u32,
    last_name: Vec<u8>,
}

impl SendState {
    /// Fresh state for a new list exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialises one entry.
    pub fn send_entry<W: Write>(
        &mut self,
        f: &mut W,
        entry: &FileEntry,
        opts: &CodecOptions,
    ) -> io::Result<()> {
        let name = entry.name_bytes();

        let mut entry_flags = entry.flags & flags::DELETE;
        if entry.mode == self.last_mode {
            entry_flags |= flags::SAME_MODE;
        }
        if entry.rdev == self.last_rdev {
            entry_flags |= flags::SAME_RDEV;
        }
        if entry.uid == self.last_uid {
            entry_flags |= flags::SAME_UID;
        }
        if entry.gid == self.last_gid {
            entry_flags |= flags::SAME_GID;
        }
        if entry.modtime == self.last_time {
            entry_flags |= flags::SAME_TIME;
        }

        let l1 = name
            .iter()
            .zip(self.last_name.iter())
            .take(255)
            .take_while(|(a, b)| a == b)
            .count();
        let l2 = name.len() - l1;

        if l1 > 0 {
            entry_flags |= flags::SAME_NAME;
        }
        if l2 > 255 {
            entry_flags |= flags::LONG_NAME;
        }

        // a zero flags byte would read as the list terminator
        if entry_flags == 0 && !entry.is_dir() {
            entry_flags |= flags::DELETE;
        }
        if entry_flags == 0 {
            entry_flags |= flags::LONG_NAME;
        }

        f.write_byte(entry_flags)?;
        if entry_flags & flags::SAME_NAME != 0 {
            f.write_byte(l1 as u8)?;
        }
        if entry_flags & flags::LONG_NAME != 0 {
            f.write_int(l2 as i32)?;
        } else {
            f.write_byte(l2 as u8)?;
        }
        f.write_all(&name[l1..])?;

        f.write_longint(entry.length as i64, opts.protocol)?;
        if entry_flags & flags::SAME_TIME == 0 {
            f.write_int(entry.modtime as i32)?;
        }
        if entry_flags & flags::SAME_MODE == 0 {
            f.write_int(to_wire_mode(entry.mode) as i32)?;
        }
        if opts.preserve_uid && entry_flags & flags::SAME_UID == 0 {
            f.write_int(entry.uid as i32)?;
        }
        if opts.preserve_gid && entry_flags & flags::SAME_GID == 0 {
            f.write_int(entry.gid as i32)?;
        }
        if opts.preserve_devices && entry.is_device() && entry_flags & flags::SAME_RDEV == 0 {
            f.write_int(entry.rdev as i32)?;
        }

        if opts.preserve_links && entry.is_symlink() {
            let link = entry.link.as_deref().unwrap_or_else(|| OsStr::new(""));
            f.write_int(link.as_bytes().len() as i32)?;
            f.write_all(link.as_bytes())?;
        }

        if opts.preserve_hard_links && entry.is_regular() {
            if opts.protocol < 26 {
                // 32-bit dev_t and ino_t
                f.write_int(entry.dev as i32)?;
                f.write_int(entry.inode as i32)?;
            } else {
                f.write_longint(entry.dev as i64, opts.protocol)?;
                f.write_longint(entry.inode as i64, opts.protocol)?;
            }
        }

        if opts.always_checksum {
            let sum = entry.sum.unwrap_or([0u8; SUM_LENGTH]);
            f.write_all(&sum[..opts.checksum_len()])?;
        }

        self.last_mode = entry.mode;
        self.last_rdev = entry.rdev;
        self.last_uid = entry.uid;
        self.last_gid = entry.gid;
        self.last_time = entry.modtime;
        self.last_name = name;

        Ok(())
    }
}

/// Receiver-side incremental state, mirroring [`SendState`] exactly.
#[derive(Clone, Debug, Default)]
pub struct RecvState {
    last_time: i64,
    last_mode: u32,
    last_rdev: u32,
    last_uid: u32,
    last_gid: u32,
    last_name: Vec<u8>,
    last_dir: Option<Arc<OsStr>>,
}

impl RecvState {
    /// Fresh state for a new list exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialises one entry introduced by `entry_flags`.
    pub fn recv_entry<R: Read>(
        &mut self,
        f: &mut R,
        entry_flags: u8,
        opts: &CodecOptions,
    ) -> io::Result<FileEntry> {
        let l1 = if entry_flags & flags::SAME_NAME != 0 {
            usize::from(f.read_byte()?)
        } else {
            0
        };
        let l2 = if entry_flags & flags::LONG_NAME != 0 {
            let value = f.read_int()?;
            usize::try_from(value).map_err(|_| overflow("negative name length"))?
        } else {
            usize::from(f.read_byte()?)
        };

        if l1 > self.last_name.len() || l2 >= MAXPATHLEN - l1 {
            return Err(overflow("file name too long"));
        }

        let mut raw_name = Vec::with_capacity(l1 + l2);
        raw_name.extend_from_slice(&self.last_name[..l1]);
        let suffix = f.read_vec(l2)?;
        raw_name.extend_from_slice(&suffix);
        self.last_name = raw_name.clone();

        let mut name = clean_path(&raw_name);
        if opts.sanitize_paths {
            name = sanitize_path(&name);
        }

        let (dirname, basename) = match name.iter().rposition(|&b| b == b'/') {
            Some(pos) => {
                let dir_bytes = &name[..pos];
                let dir = match &self.last_dir {
                    Some(last) if last.as_bytes() == dir_bytes => Arc::clone(last),
                    _ => {
                        let fresh: Arc<OsStr> = Arc::from(OsStr::from_bytes(dir_bytes));
                        self.last_dir = Some(Arc::clone(&fresh));
                        fresh
                    }
                };
                (Some(dir), OsStr::from_bytes(&name[pos + 1..]).to_os_string())
            }
            None => (None, OsStr::from_bytes(&name).to_os_string()),
        };

        let mut entry = FileEntry {
            flags: entry_flags & flags::DELETE,
            basename,
            dirname,
            ..FileEntry::default()
        };

        let length = f.read_longint(opts.protocol)?;
        entry.length = u64::try_from(length).map_err(|_| overflow("negative file length"))?;
        entry.modtime = if entry_flags & flags::SAME_TIME != 0 {
            self.last_time
        } else {
            i64::from(f.read_int()?)
        };
        entry.mode = if entry_flags & flags::SAME_MODE != 0 {
            self.last_mode
        } else {
            from_wire_mode(f.read_int()? as u32)
        };
        if opts.preserve_uid {
            entry.uid = if entry_flags & flags::SAME_UID != 0 {
                self.last_uid
            } else {
                f.read_int()? as u32
            };
        }
        if opts.preserve_gid {
            entry.gid = if entry_flags & flags::SAME_GID != 0 {
                self.last_gid
            } else {
                f.read_int()? as u32
            };
        }
        if opts.preserve_devices && entry.is_device() {
            entry.rdev = if entry_flags & flags::SAME_RDEV != 0 {
                self.last_rdev
            } else {
                f.read_int()? as u32
            };
        }

        if opts.preserve_links && entry.is_symlink() {
            let len = f.read_int()?;
            let len = usize::try_from(len).map_err(|_| overflow("negative link length"))?;
            if len >= MAXPATHLEN {
                return Err(overflow("symlink target too long"));
            }
            let mut target = f.read_vec(len)?;
            if opts.sanitize_paths {
                target = sanitize_path(&target);
            }
            entry.link = Some(OsStr::from_bytes(&target).to_os_string());
        }

        if opts.preserve_hard_links && entry.is_regular() {
            if opts.protocol < 26 {
                entry.dev = f.read_int()? as u32 as u64;
                entry.inode = f.read_int()? as u32 as u64;
            } else {
                entry.dev = f.read_longint(opts.protocol)? as u64;
                entry.inode = f.read_longint(opts.protocol)? as u64;
            }
        }

        if opts.always_checksum {
            let mut sum = [0u8; SUM_LENGTH];
            f.read_exact(&mut sum[..opts.checksum_len()])?;
            entry.sum = Some(sum);
        }

        self.last_mode = entry.mode;
        self.last_rdev = entry.rdev;
        self.last_uid = entry.uid;
        self.last_gid = entry.gid;
        self.last_time = entry.modtime;

        Ok(entry)
    }
}

fn overflow(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("overflow: {what}"))
}

/// Transmits a complete file list: the entries, the zero terminator,
/// the uid/gid name table (protocol ≥ 15) and the accumulated I/O-error
/// flag (protocol ≥ 17).
pub fn send_file_list<W: Write>(
    f: &mut W,
    list: &FileList,
    opts: &CodecOptions,
    io_error: bool,
    resolve_uid: &dyn Fn(u32) -> Option<Vec<u8>>,
    resolve_gid: &dyn Fn(u32) -> Option<Vec<u8>>,
) -> io::Result<()> {
    let mut state = SendState::new();
    for entry in &list.entries {
        state.send_entry(f, entry, opts)?;
    }
    f.write_byte(0)?;

    if opts.protocol >= 15 {
        if opts.preserve_uid {
            send_name_section(f, list.entries.iter().map(|e| e.uid), resolve_uid)?;
        }
        if opts.preserve_gid {
            send_name_section(f, list.entries.iter().map(|e| e.gid), resolve_gid)?;
        }
    }

    if opts.protocol >= 17 {
        f.write_int(i32::from(io_error))?;
    }
    Ok(())
}

fn send_name_section<W: Write>(
    f: &mut W,
    ids: impl Iterator<Item = u32>,
    resolve: &dyn Fn(u32) -> Option<Vec<u8>>,
) -> io::Result<()> {
    let mut seen = Vec::new();
    for id in ids {
        // id 0 doubles as the section terminator and is never named
        if id == 0 || seen.contains(&id) {
            continue;
        }
        seen.push(id);
        if let Some(name) = resolve(id) {
            if name.is_empty() || name.len() > 255 {
                continue;
            }
            f.write_int(id as i32)?;
            f.write_byte(name.len() as u8)?;
            f.write_all(&name)?;
        }
    }
    f.write_int(0)
}

/// Receives a complete file list; returns it together with the peer's
/// I/O-error flag (always `false` before protocol 17).
pub fn recv_file_list<R: Read>(f: &mut R, opts: &CodecOptions) -> io::Result<(FileList, bool)> {
    let mut list = FileList::new();
    let mut state = RecvState::new();

    loop {
        let entry_flags = f.read_byte()?;
        if entry_flags == 0 {
            break;
        }
        let entry = state.recv_entry(f, entry_flags, opts)?;
        list.entries.push(entry);
    }

    list.clean(opts.strip_root);

    if opts.protocol >= 15 {
        if opts.preserve_uid {
            list.names.uids = recv_name_section(f)?;
        }
        if opts.preserve_gid {
            list.names.gids = recv_name_section(f)?;
        }
    }

    let io_error = if opts.protocol >= 17 {
        f.read_int()? != 0
    } else {
        false
    };

    tracing::debug!(count = list.len(), io_error, "received file list");
    Ok((list, io_error))
}

fn recv_name_section<R: Read>(f: &mut R) -> io::Result<Vec<(u32, Vec<u8>)>> {
    let mut table = Vec::new();
    loop {
        let id = f.read_int()?;
        if id == 0 {
            return Ok(table);
        }
        let len = usize::from(f.read_byte()?);
        let name = f.read_vec(len)?;
        table.push((id as u32, name));
    }
}
