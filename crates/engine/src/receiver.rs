use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use checksums::FileDigest;
use crossbeam_channel::Sender;
use flist::{FileEntry, FileList};
use protocol::token::TokenEvent;
use protocol::wire::ReadWire;
use protocol::{DemuxReader, TokenCodec, SHORT_SUM_LENGTH, SUM_LENGTH};

use crate::error::{EngineError, Result};
use crate::fileio::FileWriter;
use crate::map::MapWindow;
use crate::options::Options;
use crate::perms::set_perms;
use crate::stats::Stats;

/// Outcome of one file's reconstruction.
enum RecvOutcome {
    /// Digest verified (or the stream carries none).
    Ok,
    /// Digest mismatch at the short checksum length: retry in phase 1.
    Redo,
    /// Digest mismatch at the full length: the data itself is bad.
    Corrupt,
}

/// The receiver reads `(index, header, tokens, digest)` groups from the
/// sender and reconstructs each file next to its destination before
/// renaming it into place. Files whose digest fails at the short
/// checksum length are queued on the redo channel for the generator's
/// second pass. Returns whether any per-file error was recorded.
pub fn recv_files<R: Read>(
    f_in: &mut DemuxReader<R>,
    flist: &FileList,
    dest_root: &Path,
    local_name: Option<&Path>,
    redo: &Sender<i32>,
    opts: &Options,
    protocol: i32,
    seed: u32,
    stats: &mut Stats,
) -> Result<bool> {
    let mut codec = TokenCodec::new(opts.compress);
    let mut csum_len = SHORT_SUM_LENGTH;
    let mut phase = 0;
    let mut any_error = false;

    tracing::debug!(count = flist.len(), "recv_files starting");

    loop {
        let index = f_in.read_int()?;
        if index == -1 {
            if phase == 0 && protocol >= 13 {
                phase = 1;
                csum_len = SUM_LENGTH;
                tracing::debug!("recv_files phase 1");
                redo.send(-1)
                    .map_err(|_| EngineError::Ipc("redo channel closed".into()))?;
                continue;
            }
            break;
        }

        let entry = flist
            .get(index)
            .filter(|e| !e.suppressed)
            .ok_or_else(|| {
                EngineError::protocol(format!(
                    "invalid file index {index} in recv_files (count={})",
                    flist.len()
                ))
            })?;

        stats.num_transferred_files += 1;
        stats.total_transferred_size += entry.length;

        let fname = match local_name {
            Some(name) => name.to_path_buf(),
            None => dest_root.join(entry.name()),
        };
        tracing::debug!(index, name = %fname.display(), "receiving");

        // open the basis for block lookups, falling back to the
        // alternate tree when the destination is absent
        let mut basis = File::open(&fname).ok();
        if basis.is_none() {
            if let Some(compare_dest) = &opts.compare_dest {
                basis = File::open(compare_dest.join(entry.name())).ok();
            }
        }

        // with permissions unpreserved the rebuilt file keeps the bits
        // the basis already had
        let mut entry = entry.clone();
        let mut discard = false;
        let mut map = match basis {
            Some(file) => match file.metadata() {
                Ok(meta) if meta.is_file() => {
                    use std::os::unix::fs::MetadataExt;
                    if !opts.preserve_perms {
                        entry.mode = meta.mode();
                    }
                    if meta.len() > 0 {
                        Some(MapWindow::new(file, meta.len()))
                    } else {
                        None
                    }
                }
                Ok(_) => {
                    // something non-regular is in the way; consume the
                    // stream but leave the path alone
                    tracing::error!(name = %fname.display(), "not a regular file");
                    any_error = true;
                    discard = true;
                    None
                }
                Err(err) => {
                    tracing::error!(name = %fname.display(), %err, "fstat failed");
                    any_error = true;
                    discard = true;
                    None
                }
            },
            None => None,
        };

        // reconstruct into a dot-named sibling (or the temp dir)
        let tmp = if discard {
            None
        } else {
            match make_temp(&fname, opts) {
                Ok(tmp) => Some(tmp),
                Err(err) => {
                    tracing::error!(name = %fname.display(), %err, "mkstemp failed");
                    any_error = true;
                    None
                }
            }
        };

        let mut writer = tmp.as_ref().and_then(|tmp| {
            tmp.as_file()
                .try_clone()
                .ok()
                .map(|file| FileWriter::new(file, opts.sparse_files))
        });

        let (outcome, literal, matched) = receive_data(
            f_in,
            &mut codec,
            map.as_mut(),
            writer.as_mut(),
            seed,
            csum_len,
            protocol,
        )?;
        stats.literal_data += literal;
        stats.matched_data += matched;
        drop(map);

        // settle a trailing sparse hole before the rename
        if let Some(writer) = writer.take() {
            if let Err(err) = writer.finish() {
                tracing::error!(name = %fname.display(), %err, "write failed");
                any_error = true;
            }
        }

        let Some(tmp) = tmp else {
            continue;
        };

        match outcome {
            RecvOutcome::Ok => {
                if let Err(err) = finish_transfer(&fname, tmp, &entry, opts) {
                    tracing::error!(name = %fname.display(), %err, "rename failed");
                    any_error = true;
                }
            }
            RecvOutcome::Redo => {
                tracing::info!(index, name = %fname.display(), "redoing after checksum mismatch");
                redo.send(index)
                    .map_err(|_| EngineError::Ipc("redo channel closed".into()))?;
            }
            RecvOutcome::Corrupt => {
                tracing::error!(
                    name = %fname.display(),
                    "ERROR: file corruption. File changed during transfer?"
                );
                any_error = true;
                if opts.partial {
                    if let Err(err) = finish_transfer(&fname, tmp, &entry, opts) {
                        tracing::error!(name = %fname.display(), %err, "rename failed");
                    }
                }
                // otherwise the temp file is dropped and the old
                // destination stays untouched
            }
        }
    }

    // repair directory modes and times relaxed during the transfer
    if local_name.is_none() {
        for entry in &flist.entries {
            if entry.suppressed || !entry.is_dir() {
                continue;
            }
            let path = dest_root.join(entry.name());
            if let Err(err) = set_perms(&path, entry, None, opts) {
                tracing::debug!(name = %path.display(), %err, "directory tail fix-up failed");
            }
        }
    }

    tracing::debug!("recv_files finished");
    Ok(any_error)
}

/// Reads one file's signature header, token stream and trailing digest,
/// writing reconstructed bytes through `writer`. With `writer` absent
/// the stream is consumed and discarded to stay in sync.
fn receive_data<R: Read>(
    f_in: &mut DemuxReader<R>,
    codec: &mut TokenCodec,
    mut map: Option<&mut MapWindow>,
    mut writer: Option<&mut FileWriter>,
    seed: u32,
    csum_len: usize,
    protocol: i32,
) -> Result<(RecvOutcome, u64, u64)> {
    let count = f_in.read_int()?;
    let block_len = f_in.read_int()?;
    let remainder = f_in.read_int()?;
    if count < 0 || block_len <= 0 || remainder < 0 {
        return Err(EngineError::protocol(format!(
            "invalid delta header: count={count} n={block_len} rem={remainder}"
        )));
    }

    let mut file_sum = FileDigest::new(seed);
    let mut literal = 0u64;
    let mut matched = 0u64;

    loop {
        match codec.recv_token(f_in).map_err(EngineError::from)? {
            TokenEvent::Literal(n) => {
                let data = codec.literal_data(n);
                file_sum.update(data);
                literal += n as u64;
                if let Some(writer) = writer.as_deref_mut() {
                    writer.write_block(data)?;
                }
            }
            TokenEvent::Match(block) => {
                if !(0..count).contains(&block) {
                    return Err(EngineError::protocol(format!(
                        "match token {block} out of range (count={count})"
                    )));
                }
                let offset = u64::from(block as u32) * u64::from(block_len as u32);
                let len = if block == count - 1 && remainder != 0 {
                    remainder as usize
                } else {
                    block_len as usize
                };
                matched += len as u64;

                if let Some(map) = map.as_deref_mut() {
                    let bytes = map.slice(offset, len)?;
                    codec.see_token(bytes)?;
                    file_sum.update(bytes);
                    if let Some(writer) = writer.as_deref_mut() {
                        // the map's buffer and the writer cannot borrow
                        // at once; stage through a copy
                        let copy = bytes.to_vec();
                        writer.write_block(&copy)?;
                    }
                }
            }
            TokenEvent::Done => break,
        }
    }

    let local = file_sum.finalize();

    if protocol >= 14 {
        let mut remote = [0u8; 16];
        f_in.read_exact(&mut remote)?;
        if writer.is_some() && local != remote {
            let outcome = if csum_len == SUM_LENGTH {
                RecvOutcome::Corrupt
            } else {
                RecvOutcome::Redo
            };
            return Ok((outcome, literal, matched));
        }
    }
    Ok((RecvOutcome::Ok, literal, matched))
}

/// Creates the reconstruction temp file as a dot-prefixed sibling of
/// the target (or inside the configured temp dir).
fn make_temp(fname: &Path, opts: &Options) -> io::Result<tempfile::NamedTempFile> {
    let base = fname
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
    let dir = match &opts.temp_dir {
        Some(dir) => dir.clone(),
        None => fname
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let mut prefix = std::ffi::OsString::from(".");
    prefix.push(base);
    prefix.push(".");
    tempfile::Builder::new()
        .prefix(&prefix)
        .rand_bytes(6)
        .tempfile_in(dir)
}

/// Moves the finished temp file over the destination and restores
/// metadata. A cross-device rename falls back to copy + unlink.
fn finish_transfer(
    fname: &Path,
    tmp: tempfile::NamedTempFile,
    entry: &FileEntry,
    opts: &Options,
) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if opts.backup {
        let mut backup = fname.as_os_str().to_os_string();
        backup.push(&opts.backup_suffix);
        match fs::rename(fname, &backup) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    // the temp file was created private; give the final file its real
    // bits before it becomes visible
    let mode = entry.mode & 0o7777;
    tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;

    let tmp_path = tmp.path().to_path_buf();
    match tmp.persist(fname) {
        Ok(_) => {}
        Err(persist_err) if persist_err.error.raw_os_error() == Some(libc::EXDEV) => {
            // cross-filesystem temp dir: copy the bytes instead; the
            // temp file cleans itself up on drop
            fs::copy(&tmp_path, fname)?;
        }
        Err(persist_err) => return Err(persist_err.error),
    }

    if let Err(err) = set_perms(fname, entry, None, opts) {
        tracing::error!(name = %fname.display(), %err, "failed to set permissions");
    }
    Ok(())
}
