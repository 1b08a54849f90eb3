use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use flist::{file_checksum, FileEntry, FileList};
use protocol::wire::WriteWire;
use protocol::{MuxWriter, SHORT_SUM_LENGTH, SUM_LENGTH};
use signature::{adapt_block_size, Signatures};

use crate::error::{EngineError, Result};
use crate::options::Options;
use crate::perms::{am_root, set_perms};

const S_IFMT: u32 = 0o170000;
const S_IWUSR: u32 = 0o200;

/// The generator walks the shared file list, decides per entry what the
/// destination needs, and emits `(index, signatures)` pairs toward the
/// sender. Directories, symlinks and device nodes are handled locally
/// and never produce sender traffic.
pub struct Generator<'a, W: Write> {
    f_out: &'a mut MuxWriter<W>,
    opts: &'a Options,
    protocol: i32,
    seed: u32,
    dest_root: &'a Path,
    local_name: Option<&'a Path>,
    csum_len: usize,
    ignore_times: bool,
    hardlink_skip: HashSet<usize>,
    am_root: bool,
}

impl<'a, W: Write> Generator<'a, W> {
    /// Builds a generator for one transfer.
    pub fn new(
        f_out: &'a mut MuxWriter<W>,
        opts: &'a Options,
        protocol: i32,
        seed: u32,
        dest_root: &'a Path,
        local_name: Option<&'a Path>,
    ) -> Self {
        Self {
            f_out,
            opts,
            protocol,
            seed,
            dest_root,
            local_name,
            csum_len: SHORT_SUM_LENGTH,
            ignore_times: opts.ignore_times,
            hardlink_skip: HashSet::new(),
            am_root: am_root(),
        }
    }

    /// Runs both generator passes: the full sweep over the list, then
    /// the redo pass fed by the receiver until its `-1` sentinel.
    pub fn run(&mut self, flist: &FileList, redo: &Receiver<i32>) -> Result<()> {
        if self.opts.preserve_hard_links {
            self.hardlink_skip = hardlink_duplicates(flist);
        }

        for (index, entry) in flist.entries.iter().enumerate() {
            if entry.suppressed {
                continue;
            }

            // directories we create must be enterable while their
            // contents stream in; the tail pass restores the real bits
            let mut entry = entry.clone();
            if !self.am_root && entry.is_dir() {
                entry.mode |= S_IWUSR;
            }

            self.generate_one(index as i32, &entry)?;
        }

        self.csum_len = SUM_LENGTH;
        self.ignore_times = true;
        tracing::debug!("generator phase 1");
        self.f_out.write_int(-1)?;
        self.f_out.flush()?;

        if self.protocol >= 13 {
            // files can cycle through a second time to catch checksum
            // failures at the short digest length
            loop {
                let index = redo
                    .recv()
                    .map_err(|_| EngineError::Ipc("redo channel closed".into()))?;
                if index == -1 {
                    break;
                }
                let entry = flist
                    .get(index)
                    .filter(|e| !e.suppressed)
                    .ok_or_else(|| {
                        EngineError::protocol(format!("invalid redo index {index}"))
                    })?
                    .clone();
                tracing::info!(index, name = %entry.name().display(), "redoing");
                self.generate_one(index, &entry)?;
            }

            tracing::debug!("generator phase 2");
            self.f_out.write_int(-1)?;
            self.f_out.flush()?;
        }

        Ok(())
    }

    fn target_path(&self, entry: &FileEntry) -> PathBuf {
        match self.local_name {
            Some(name) => name.to_path_buf(),
            None => self.dest_root.join(entry.name()),
        }
    }

    /// Decides what to do for one list entry; mirrors the per-file
    /// decision ladder of the classic generator.
    fn generate_one(&mut self, index: i32, entry: &FileEntry) -> Result<()> {
        if self.opts.list_only {
            return Ok(());
        }

        let fname = self.target_path(entry);
        tracing::trace!(index, name = %fname.display(), "generating");

        let mut stat = fs::symlink_metadata(&fname).ok();

        if self.opts.only_existing && stat.is_none() {
            tracing::debug!(name = %fname.display(), "not creating new file");
            return Ok(());
        }

        // with permissions unpreserved an existing file keeps the bits
        // it already has
        let mut entry = entry.clone();
        if let Some(st) = &stat {
            use std::os::unix::fs::MetadataExt;
            if !self.opts.preserve_perms && st.is_dir() == entry.is_dir() {
                entry.mode = (entry.mode & S_IFMT) | (st.mode() & !S_IFMT);
            }
        }

        if entry.is_dir() {
            return self.generate_directory(&fname, &entry, &mut stat);
        }

        if self.opts.preserve_links && entry.is_symlink() {
            return self.generate_symlink(&fname, &entry, stat.as_ref());
        }

        if self.am_root && self.opts.preserve_devices && entry.is_device() {
            return self.generate_device(&fname, &entry, stat.as_ref());
        }

        if self.opts.preserve_hard_links && self.hardlink_skip.contains(&(index as usize)) {
            tracing::debug!(name = %fname.display(), "is a hard link");
            return Ok(());
        }

        if !entry.is_regular() {
            tracing::info!(name = %fname.display(), "skipping non-regular file");
            return Ok(());
        }

        self.generate_regular(index, &fname, &entry, stat)
    }

    fn generate_directory(
        &mut self,
        fname: &Path,
        entry: &FileEntry,
        stat: &mut Option<fs::Metadata>,
    ) -> Result<()> {
        if let Some(st) = stat {
            if !st.is_dir() {
                if let Err(err) = fs::remove_file(fname) {
                    tracing::error!(name = %fname.display(), %err, "unlink to make room for directory");
                    return Ok(());
                }
                *stat = None;
            }
        }
        if stat.is_none() {
            use std::os::unix::fs::DirBuilderExt;
            let result = fs::DirBuilder::new()
                .mode(entry.mode & 0o7777)
                .create(fname);
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    tracing::error!(name = %fname.display(), %err, "mkdir failed");
                    return Ok(());
                }
            }
        }
        if let Err(err) = set_perms(fname, entry, None, self.opts) {
            tracing::error!(name = %fname.display(), %err, "failed to set permissions on directory");
        }
        Ok(())
    }

    fn generate_symlink(
        &mut self,
        fname: &Path,
        entry: &FileEntry,
        stat: Option<&fs::Metadata>,
    ) -> Result<()> {
        let Some(target) = &entry.link else {
            return Ok(());
        };

        if stat.is_some() {
            if let Ok(existing) = fs::read_link(fname) {
                if existing.as_os_str() == target.as_os_str() {
                    // already pointing at the right place
                    let _ = set_perms(fname, entry, stat, self.opts);
                    return Ok(());
                }
            }
            let _ = fs::remove_file(fname);
        }

        match std::os::unix::fs::symlink(target, fname) {
            Ok(()) => {
                let _ = set_perms(fname, entry, None, self.opts);
                tracing::info!(name = %fname.display(), target = %Path::new(target).display(), "symlink");
            }
            Err(err) => {
                tracing::error!(name = %fname.display(), %err, "symlink failed");
            }
        }
        Ok(())
    }

    fn generate_device(
        &mut self,
        fname: &Path,
        entry: &FileEntry,
        stat: Option<&fs::Metadata>,
    ) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let matches = stat
            .map(|st| st.mode() == entry.mode && st.rdev() as u32 == entry.rdev)
            .unwrap_or(false);
        if matches {
            let _ = set_perms(fname, entry, stat, self.opts);
            return Ok(());
        }

        if stat.is_some() {
            let _ = fs::remove_file(fname);
        }
        tracing::debug!(name = %fname.display(), mode = entry.mode, rdev = entry.rdev, "mknod");

        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(fname.as_os_str().as_bytes())
            .map_err(|_| EngineError::protocol("path contains NUL"))?;
        // SAFETY: c_path is valid and NUL terminated for the call
        let rc = unsafe {
            libc::mknod(
                c_path.as_ptr(),
                entry.mode as libc::mode_t,
                libc::dev_t::from(entry.rdev),
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(name = %fname.display(), %err, "mknod failed");
        } else {
            let _ = set_perms(fname, entry, None, self.opts);
        }
        Ok(())
    }

    fn generate_regular(
        &mut self,
        index: i32,
        fname: &Path,
        entry: &FileEntry,
        stat: Option<fs::Metadata>,
    ) -> Result<()> {
        // when the destination is missing, an alternate tree can stand
        // in as the block source
        let mut fnamecmp = fname.to_path_buf();
        let mut stat = stat;
        let mut using_compare_dest = false;
        if stat.is_none() {
            if let Some(compare_dest) = &self.opts.compare_dest {
                let alternate = compare_dest.join(entry.name());
                if let Ok(st) = fs::symlink_metadata(&alternate) {
                    if st.is_file() {
                        fnamecmp = alternate;
                        stat = Some(st);
                        using_compare_dest = true;
                    }
                }
            }
        }

        let Some(st) = stat else {
            // nothing on disk: ask for the whole file
            self.f_out.write_int(index)?;
            Signatures::send_empty(self.f_out, self.opts.block_size)?;
            return Ok(());
        };

        if !st.is_file() {
            if fs::remove_file(fname).is_err() {
                return Ok(());
            }
            // now pretend it never existed
            self.f_out.write_int(index)?;
            Signatures::send_empty(self.f_out, self.opts.block_size)?;
            return Ok(());
        }

        if self.opts.ignore_existing && !using_compare_dest {
            tracing::debug!(name = %fname.display(), "exists");
            return Ok(());
        }

        use std::os::unix::fs::MetadataExt;
        if self.opts.update_only && st.mtime() > entry.modtime && !using_compare_dest {
            tracing::debug!(name = %fname.display(), "is newer");
            return Ok(());
        }

        if self.skip_file(fname, entry, &st) {
            if !using_compare_dest {
                let _ = set_perms(fname, entry, Some(&st), self.opts);
            }
            return Ok(());
        }

        if self.opts.whole_file {
            self.f_out.write_int(index)?;
            Signatures::send_empty(self.f_out, self.opts.block_size)?;
            return Ok(());
        }

        let file = match File::open(&fnamecmp) {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(name = %fnamecmp.display(), %err, "failed to open, continuing");
                self.f_out.write_int(index)?;
                Signatures::send_empty(self.f_out, self.opts.block_size)?;
                return Ok(());
            }
        };

        let block_len = adapt_block_size(entry.length, self.opts.block_size);
        let sigs = {
            let mut reader = io::BufReader::new(file);
            Signatures::generate(&mut reader, st.len(), block_len, self.seed)
        };
        let sigs = match sigs {
            Ok(sigs) => sigs,
            Err(err) => {
                // the basis changed underneath us; fall back to a full
                // transfer
                tracing::error!(name = %fnamecmp.display(), %err, "signature generation failed");
                self.f_out.write_int(index)?;
                Signatures::send_empty(self.f_out, self.opts.block_size)?;
                return Ok(());
            }
        };

        tracing::trace!(index, count = sigs.count(), "sending sums");
        self.f_out.write_int(index)?;
        sigs.send(self.f_out, self.csum_len)?;
        Ok(())
    }

    /// Is the destination file already up to date?
    fn skip_file(&self, fname: &Path, entry: &FileEntry, st: &fs::Metadata) -> bool {
        use std::os::unix::fs::MetadataExt;

        if st.len() != entry.length {
            return false;
        }

        // with checksumming on, content decides instead of the mtime
        if self.opts.always_checksum && st.is_file() {
            let Some(expected) = &entry.sum else {
                return false;
            };
            let mut path = fname.to_path_buf();
            if let Some(compare_dest) = &self.opts.compare_dest {
                if fs::symlink_metadata(&path).is_err() {
                    path = compare_dest.join(entry.name());
                }
            }
            let sum = file_checksum(&path, self.seed);
            let len = if self.protocol < 21 { 2 } else { SUM_LENGTH };
            return sum[..len] == expected[..len];
        }

        if self.opts.size_only {
            return true;
        }

        if self.ignore_times {
            return false;
        }

        self.opts.same_time(st.mtime(), entry.modtime)
    }
}

/// Indices of regular entries whose dev/inode pair already appeared
/// earlier in the list; those are left for a hardlink pass instead of
/// being transferred again.
fn hardlink_duplicates(flist: &FileList) -> HashSet<usize> {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut dups = HashSet::new();
    for (index, entry) in flist.entries.iter().enumerate() {
        if entry.suppressed || !entry.is_regular() || (entry.dev, entry.inode) == (0, 0) {
            continue;
        }
        if !seen.insert((entry.dev, entry.inode)) {
            dups.insert(index);
        }
    }
    dups
}
