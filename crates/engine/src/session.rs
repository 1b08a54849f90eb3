//! Wires the three roles onto an established duplex stream.
//!
//! The transport is whatever the caller hands in: a socket, a remote
//! shell's pipes, or the in-memory test pipe. Both entry points run the
//! startup handshake, the filter and file-list exchanges, the per-file
//! phases and the closing statistics/goodbye dance, returning the
//! transfer counters and an advisory exit code.

use std::ffi::CStr;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bandwidth::BandwidthLimiter;
use flist::{build_file_list, recv_file_list, recv_filter_list, send_file_list, send_filter_list, FileList};
use protocol::version::{setup_protocol, Role};
use protocol::wire::{ReadWire, WriteWire};
use protocol::{DemuxReader, ExitCode, MuxWriter};

use crate::error::{EngineError, Result};
use crate::generator::Generator;
use crate::options::Options;
use crate::receiver::recv_files;
use crate::sender::send_files;
use crate::stats::Stats;

/// Result of a completed session.
#[derive(Clone, Copy, Debug)]
pub struct SessionOutcome {
    /// Transfer counters.
    pub stats: Stats,
    /// Advisory exit code: [`ExitCode::Ok`], or [`ExitCode::Partial`]
    /// when any file was skipped or failed without aborting.
    pub exit: ExitCode,
}

/// Runs the sending side as the invoked (server) peer: receive the
/// filter chain, walk and send the file list, then answer signature
/// requests with token streams until both phases finish.
pub fn serve_sender<R, W>(
    reader: R,
    writer: W,
    paths: &[PathBuf],
    opts: &Options,
) -> Result<SessionOutcome>
where
    R: Read,
    W: Write,
{
    let mut demux = DemuxReader::new(reader);
    let mut mux =
        MuxWriter::new(writer).with_limiter(opts.bwlimit.map(BandwidthLimiter::new));

    let session = setup_protocol(&mut demux, &mut mux, Role::Server, None)?;
    let protocol = session.protocol;
    if protocol >= 23 {
        mux.start_multiplex()?;
    }

    // the receiving side's exclusions join our own
    let peer_filters = recv_filter_list(&mut demux)?;
    let mut build = opts.build_options(session.checksum_seed);
    build.filters.extend(peer_filters);

    let (mut flist, walk_error) = build_file_list(paths, &build);

    let codec_opts = opts.codec_options(protocol);
    let mut stats = Stats::default();
    let flist_start = mux.total_written();
    send_file_list(
        &mut mux,
        &flist,
        &codec_opts,
        walk_error,
        &uid_name,
        &gid_name,
    )?;
    mux.flush()?;
    flist.clean(false);

    stats.flist_size = mux.total_written() - flist_start;
    stats.num_files = flist.len() as u64;
    stats.total_size = flist.total_size();

    if flist.is_empty() {
        mux.flush()?;
        return Ok(SessionOutcome {
            stats,
            exit: if walk_error {
                ExitCode::Partial
            } else {
                ExitCode::Ok
            },
        });
    }

    let send_error = send_files(
        &mut demux,
        &mut mux,
        &flist,
        opts,
        protocol,
        session.checksum_seed,
        &mut stats,
    )?;

    stats.total_read = demux.total_read();
    stats.total_written = mux.total_written();
    if protocol >= 20 {
        stats.send(&mut mux, protocol)?;
        mux.flush()?;
    }
    if protocol >= 24 {
        // final goodbye message
        demux.read_int()?;
    }
    mux.flush()?;

    let exit = if walk_error || send_error {
        ExitCode::Partial
    } else {
        ExitCode::Ok
    };
    Ok(SessionOutcome { stats, exit })
}

/// Runs the receiving side as the invoking (client) peer: send the
/// filter chain, receive the file list, then run generator and receiver
/// concurrently until the transfer completes.
pub fn run_receiver<R, W>(
    reader: R,
    writer: W,
    dest: &Path,
    opts: &Options,
) -> Result<SessionOutcome>
where
    R: Read + Send,
    W: Write + Send,
{
    let mut demux = DemuxReader::new(reader);
    let mut mux =
        MuxWriter::new(writer).with_limiter(opts.bwlimit.map(BandwidthLimiter::new));

    let session = setup_protocol(&mut demux, &mut mux, Role::Client, None)?;
    let protocol = session.protocol;
    if protocol >= 23 {
        demux.start_multiplex();
    }

    send_filter_list(&mut mux, &opts.filters, protocol)?;
    mux.flush()?;

    let mut codec_opts = opts.codec_options(protocol);
    codec_opts.strip_root = true;

    let mut stats = Stats::default();
    let flist_start = demux.total_read();
    let (flist, peer_io_error) = recv_file_list(&mut demux, &codec_opts)?;
    stats.flist_size = demux.total_read() - flist_start;
    stats.num_files = flist.len() as u64;
    stats.total_size = flist.total_size();

    if flist.is_empty() {
        tracing::info!("nothing to do: perhaps you need to specify some filenames or --recursive?");
        return Ok(SessionOutcome {
            stats,
            exit: ExitCode::Ok,
        });
    }

    if opts.list_only {
        for entry in flist.entries.iter().filter(|e| !e.suppressed) {
            tracing::info!("{}", entry.name().display());
        }
    }

    let (dest_root, local_name) = local_destination(dest, &flist)?;

    let seed = session.checksum_seed;
    let mut recv_error = false;

    std::thread::scope(|scope| -> Result<()> {
        let (redo_tx, redo_rx) = crossbeam_channel::unbounded::<i32>();

        // the generator owns the write half, as the forked original did
        let flist_ref = &flist;
        let dest_ref = dest_root.as_path();
        let local_ref = local_name.as_deref();
        let mux_ref = &mut mux;
        let generator = scope.spawn(move || -> Result<()> {
            let mut generator =
                Generator::new(mux_ref, opts, protocol, seed, dest_ref, local_ref);
            generator.run(flist_ref, &redo_rx)
        });

        let recv_result = recv_files(
            &mut demux,
            &flist,
            &dest_root,
            local_name.as_deref(),
            &redo_tx,
            opts,
            protocol,
            seed,
            &mut stats,
        );

        // unblock the generator if we failed before the redo sentinel
        drop(redo_tx);

        // for protocol >= 20 the server's totals replace the local
        // ones; the byte counters swap direction in Stats::recv
        let recv_result = recv_result.and_then(|errors| {
            recv_error = errors;
            if protocol >= 20 {
                stats.recv(&mut demux, protocol)?;
            } else {
                stats.total_read = demux.total_read();
            }
            Ok(())
        });

        let generator_result = generator
            .join()
            .map_err(|_| EngineError::Ipc("generator thread panicked".into()))?;

        recv_result?;
        generator_result
    })?;

    if protocol >= 24 {
        // final goodbye message
        mux.write_int(-1)?;
        mux.flush()?;
    }
    if protocol < 20 {
        stats.total_written = mux.total_written();
    }

    let exit = if peer_io_error || recv_error {
        ExitCode::Partial
    } else {
        ExitCode::Ok
    };
    Ok(SessionOutcome { stats, exit })
}

/// Works out where received files land: an existing directory becomes
/// the destination root; a single-file transfer may rename onto an
/// explicit file name; otherwise the directory is created.
fn local_destination(dest: &Path, flist: &FileList) -> Result<(PathBuf, Option<PathBuf>)> {
    if let Ok(meta) = fs::metadata(dest) {
        if meta.is_dir() {
            return Ok((dest.to_path_buf(), None));
        }
    }

    let active = flist.entries.iter().filter(|e| !e.suppressed).count();
    if active == 1 {
        return Ok((PathBuf::from("."), Some(dest.to_path_buf())));
    }

    fs::create_dir(dest).map_err(|err| {
        tracing::error!(dest = %dest.display(), %err, "cannot create destination directory");
        EngineError::from(err)
    })?;
    Ok((dest.to_path_buf(), None))
}

/// Resolves a uid to its account name for the post-list name table.
fn uid_name(uid: u32) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: buffers outlive the call and result is checked before use
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: a non-null result guarantees pw_name points at a C string
    Some(unsafe { CStr::from_ptr(pwd.pw_name) }.to_bytes().to_vec())
}

/// Resolves a gid to its group name for the post-list name table.
fn gid_name(gid: u32) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    // SAFETY: buffers outlive the call and result is checked before use
    let rc = unsafe {
        libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: a non-null result guarantees gr_name points at a C string
    Some(unsafe { CStr::from_ptr(grp.gr_name) }.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_directory_becomes_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flist = FileList::new();
        let (root, local) = local_destination(dir.path(), &flist).expect("dest");
        assert_eq!(root, dir.path());
        assert!(local.is_none());
    }

    #[test]
    fn single_file_transfer_targets_the_name_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("renamed");
        let mut flist = FileList::new();
        flist.entries.push(flist::FileEntry {
            basename: "source".into(),
            mode: 0o100644,
            ..flist::FileEntry::default()
        });
        let (_, local) = local_destination(&target, &flist).expect("dest");
        assert_eq!(local.as_deref(), Some(target.as_path()));
    }

    #[test]
    fn missing_multi_file_destination_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("fresh");
        let mut flist = FileList::new();
        for name in ["a", "b"] {
            flist.entries.push(flist::FileEntry {
                basename: name.into(),
                mode: 0o100644,
                ..flist::FileEntry::default()
            });
        }
        let (root, local) = local_destination(&target, &flist).expect("dest");
        assert_eq!(root, target);
        assert!(local.is_none());
        assert!(target.is_dir());
    }

    #[test]
    fn root_uid_resolves_to_a_name() {
        // uid 0 exists on any unix test box
        let name = uid_name(0).expect("root resolves");
        assert!(!name.is_empty());
    }
}
