//! Full-pipeline tests: a sending peer and a receiving peer wired over
//! the in-memory duplex stream, exercising handshake, file-list
//! exchange, both transfer phases and the closing statistics dance.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use compress::CompressionLevel;
use engine::{run_receiver, serve_sender, Options, SessionOutcome};
use filetime::FileTime;
use flist::FilterList;
use protocol::io::duplex;
use protocol::ExitCode;

fn transfer(
    sources: Vec<PathBuf>,
    dest: PathBuf,
    sender_opts: Options,
    receiver_opts: Options,
) -> (SessionOutcome, SessionOutcome) {
    let ((srv_rx, srv_tx), (cli_rx, cli_tx)) = duplex(Some(Duration::from_secs(30)));

    let server = std::thread::spawn(move || serve_sender(srv_rx, srv_tx, &sources, &sender_opts));
    let client = run_receiver(cli_rx, cli_tx, &dest, &receiver_opts).expect("receiver");
    let server = server.join().expect("server thread").expect("sender");
    (server, client)
}

fn contents_arg(dir: &Path) -> PathBuf {
    let mut arg = dir.as_os_str().to_os_string();
    arg.push("/");
    PathBuf::from(arg)
}

fn write(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir -p");
    }
    fs::write(path, data).expect("write");
}

fn set_mtime(path: &Path, secs: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).expect("set mtime");
}

/// Compares two trees by structure and file contents.
fn assert_trees_equal(a: &Path, b: &Path) {
    let list = |root: &Path| {
        let mut names = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for item in fs::read_dir(&dir).expect("read_dir") {
                let item = item.expect("dirent");
                let path = item.path();
                let rel = path.strip_prefix(root).expect("prefix").to_path_buf();
                if item.file_type().expect("file_type").is_dir() {
                    stack.push(path);
                    names.push((rel, None));
                } else {
                    names.push((rel.clone(), Some(fs::read(&path).expect("read"))));
                }
            }
        }
        names.sort();
        names
    };
    assert_eq!(list(a), list(b));
}

#[test]
fn fresh_tree_is_copied_verbatim() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("hello.txt"), b"hello\n");
    write(&src.path().join("sub/inner.dat"), &vec![0xabu8; 4096]);
    write(&src.path().join("sub/deep/leaf"), b"leaf");

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(server.exit, ExitCode::Ok);
    assert_eq!(client.exit, ExitCode::Ok);
    assert_trees_equal(src.path(), dst.path());

    // everything was new: all bytes crossed as literals
    assert_eq!(server.stats.literal_data, 6 + 4096 + 4);
    assert_eq!(server.stats.matched_data, 0);
}

#[test]
fn identical_content_transfers_no_literal_bytes() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let payload = vec![0u8; 1000];
    write(&src.path().join("a.bin"), &payload);
    write(&dst.path().join("a.bin"), &payload);
    // different mtimes force the delta pass despite equal sizes
    set_mtime(&src.path().join("a.bin"), 1_000_000);
    set_mtime(&dst.path().join("a.bin"), 2_000_000);

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_trees_equal(src.path(), dst.path());
    assert_eq!(server.stats.literal_data, 0);
    assert_eq!(server.stats.matched_data, 1000);
}

#[test]
fn single_byte_prepend_reuses_shifted_blocks() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let original: Vec<u8> = (0u32..10_000).map(|i| (i.wrapping_mul(97) >> 3) as u8).collect();
    let mut grown = vec![b'X'];
    grown.extend_from_slice(&original);

    write(&src.path().join("f"), &grown);
    write(&dst.path().join("f"), &original);
    set_mtime(&src.path().join("f"), 1_000_000);
    set_mtime(&dst.path().join("f"), 2_000_000);

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(fs::read(dst.path().join("f")).expect("read"), grown);
    assert_eq!(server.stats.literal_data, 1);
    assert_eq!(server.stats.matched_data, 10_000);
}

#[test]
fn unchanged_files_are_skipped_entirely() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("same"), b"equal bytes");
    write(&dst.path().join("same"), b"equal bytes");
    set_mtime(&src.path().join("same"), 1_234_567);
    set_mtime(&dst.path().join("same"), 1_234_567);

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(server.stats.num_transferred_files, 0);
    assert_eq!(server.stats.literal_data, 0);
}

#[test]
fn always_checksum_skips_by_content_not_mtime() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("same"), b"stable contents");
    write(&dst.path().join("same"), b"stable contents");
    set_mtime(&src.path().join("same"), 1_000_000);
    set_mtime(&dst.path().join("same"), 9_000_000);

    let opts = Options {
        always_checksum: true,
        ..Options::default()
    };
    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        opts.clone(),
        opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(server.stats.num_transferred_files, 0);
}

#[test]
fn edits_transfer_mostly_matches() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let original: Vec<u8> = (0u32..200_000).map(|i| (i.wrapping_mul(131) >> 5) as u8).collect();
    let mut edited = original.clone();
    edited[50_000..50_050].fill(0xEE);
    edited.drain(120_000..120_700);

    write(&src.path().join("big"), &edited);
    write(&dst.path().join("big"), &original);
    set_mtime(&src.path().join("big"), 1_000_000);
    set_mtime(&dst.path().join("big"), 2_000_000);

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(fs::read(dst.path().join("big")).expect("read"), edited);
    assert!(server.stats.matched_data > server.stats.literal_data * 10);
}

#[test]
fn compressed_transfer_round_trips() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let basis: Vec<u8> = (0u32..60_000).map(|i| (i.wrapping_mul(61) >> 4) as u8).collect();
    let mut changed = basis.clone();
    changed[10_000..12_000].fill(b'z');

    write(&src.path().join("mixed"), &changed);
    write(&dst.path().join("mixed"), &basis);
    set_mtime(&src.path().join("mixed"), 1_000_000);
    set_mtime(&dst.path().join("mixed"), 2_000_000);
    write(&src.path().join("fresh.log"), &b"log line\n".repeat(500));

    let opts = Options {
        compress: Some(CompressionLevel::Default),
        ..Options::default()
    };
    let (_, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        opts.clone(),
        opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_trees_equal(src.path(), dst.path());
}

#[test]
fn whole_file_mode_ignores_the_basis() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let payload = vec![3u8; 5_000];
    write(&src.path().join("f"), &payload);
    write(&dst.path().join("f"), &payload);
    set_mtime(&src.path().join("f"), 1_000_000);
    set_mtime(&dst.path().join("f"), 2_000_000);

    let opts = Options {
        whole_file: true,
        ..Options::default()
    };
    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        opts.clone(),
        opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(server.stats.literal_data, 5_000);
    assert_eq!(server.stats.matched_data, 0);
}

#[test]
fn missing_source_raises_partial_but_continues() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("good"), b"still works");

    let (server, client) = transfer(
        vec![
            PathBuf::from("/no/such/path/anywhere"),
            contents_arg(src.path()),
        ],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    // the walk error crossed the wire as the io-error flag
    assert_eq!(server.exit, ExitCode::Partial);
    assert_eq!(client.exit, ExitCode::Partial);
    assert_eq!(fs::read(dst.path().join("good")).expect("read"), b"still works");
}

#[test]
fn receiver_filters_reach_the_sender() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("keep.c"), b"keep");
    write(&src.path().join("drop.o"), b"drop");

    let mut filters = FilterList::new();
    filters.add("*.o");
    let receiver_opts = Options {
        filters,
        ..Options::default()
    };

    let (_, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        receiver_opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert!(dst.path().join("keep.c").exists());
    assert!(!dst.path().join("drop.o").exists());
}

#[test]
fn symlinks_are_recreated() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("real"), b"data");
    std::os::unix::fs::symlink("real", src.path().join("alias")).expect("symlink");

    let opts = Options {
        preserve_links: true,
        ..Options::default()
    };
    let (_, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        opts.clone(),
        opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    let link = fs::read_link(dst.path().join("alias")).expect("read_link");
    assert_eq!(link, Path::new("real"));
    assert_eq!(fs::read(dst.path().join("alias")).expect("follow"), b"data");
}

#[test]
fn single_file_lands_on_the_named_destination() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    let source_file = src.path().join("origin.txt");
    write(&source_file, b"renamed in flight");
    let target = dst.path().join("target.txt");

    let (_, client) = transfer(
        vec![source_file],
        target.clone(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(fs::read(&target).expect("read"), b"renamed in flight");
}

#[test]
fn update_only_leaves_newer_destinations_alone() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("f"), b"older version");
    write(&dst.path().join("f"), b"newer version");
    set_mtime(&src.path().join("f"), 1_000_000);
    set_mtime(&dst.path().join("f"), 2_000_000);

    let opts = Options {
        update_only: true,
        preserve_times: false,
        ..Options::default()
    };
    let (_, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        opts.clone(),
        opts,
    );

    assert_eq!(client.exit, ExitCode::Ok);
    assert_eq!(fs::read(dst.path().join("f")).expect("read"), b"newer version");
}

#[test]
fn mtimes_are_preserved_on_new_files() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("dated"), b"contents");
    set_mtime(&src.path().join("dated"), 777_777_777);

    let (_, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    assert_eq!(client.exit, ExitCode::Ok);
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(dst.path().join("dated")).expect("stat");
    assert_eq!(meta.mtime(), 777_777_777);
}

#[test]
fn stats_travel_back_to_the_client() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");

    write(&src.path().join("payload"), &vec![1u8; 2_000]);

    let (server, client) = transfer(
        vec![contents_arg(src.path())],
        dst.path().to_path_buf(),
        Options::default(),
        Options::default(),
    );

    // the server's totals arrive via the stats exchange; the byte
    // counters swap direction, since what it read is what we wrote
    assert_eq!(client.stats.total_size, 2_000);
    assert_eq!(client.stats.total_written, server.stats.total_read);
    assert_eq!(client.stats.total_read, server.stats.total_written);
    assert!(server.stats.total_written > 2_000);
}
