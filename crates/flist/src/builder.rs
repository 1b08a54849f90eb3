use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use checksums::FileDigest;

use crate::entry::{flags, FileEntry};
use crate::filter::FilterList;
use crate::list::FileList;

/// Options steering the source-tree walk.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Descend into directories.
    pub recurse: bool,
    /// Record symlink targets.
    pub preserve_links: bool,
    /// Record dev/inode pairs on regular files.
    pub preserve_hard_links: bool,
    /// Compute a whole-file digest for every regular file.
    pub always_checksum: bool,
    /// Do not cross filesystem boundaries while recursing.
    pub one_file_system: bool,
    /// Exclusion filters applied to every name.
    pub filters: FilterList,
    /// Seed mixed into always-checksum digests.
    pub checksum_seed: u32,
}

struct Walker<'a> {
    opts: &'a BuildOptions,
    list: FileList,
    io_error: bool,
    basedir: Option<Arc<OsStr>>,
    last_dir: Option<Arc<OsStr>>,
    root_dev: u64,
}

/// Walks the source arguments and produces the in-memory file list,
/// together with the accumulated I/O-error flag.
///
/// An argument with a trailing slash transfers its *contents*: the
/// entries are named relative to it and the argument becomes their
/// `basedir`. Without the slash the final path component itself is
/// transferred. Unreadable files are skipped with the error flag set;
/// they never abort the walk.
///
/// The returned list is *not* yet cleaned; callers sort and deduplicate
/// after the wire exchange, mirroring the peer.
#[must_use]
pub fn build_file_list(args: &[PathBuf], opts: &BuildOptions) -> (FileList, bool) {
    let mut walker = Walker {
        opts,
        list: FileList::new(),
        io_error: false,
        basedir: None,
        last_dir: None,
        root_dev: 0,
    };

    for arg in args {
        walker.walk_argument(arg);
    }

    (walker.list, walker.io_error)
}

impl Walker<'_> {
    fn walk_argument(&mut self, arg: &Path) {
        let bytes = arg.as_os_str().as_bytes();
        let trailing_slash = bytes.len() > 1 && bytes.ends_with(b"/");

        let (basedir, name): (Option<&OsStr>, &[u8]) = if trailing_slash {
            // "dir/" means the contents of dir, rooted at dir
            (Some(OsStr::from_bytes(&bytes[..bytes.len() - 1])), b".")
        } else {
            match bytes.iter().rposition(|&b| b == b'/') {
                Some(0) => (Some(OsStr::new("/")), &bytes[1..]),
                Some(pos) => (Some(OsStr::from_bytes(&bytes[..pos])), &bytes[pos + 1..]),
                None => (None, bytes),
            }
        };

        self.basedir = basedir.map(Arc::from);
        self.last_dir = None;

        let fs_path = self.fs_path(name);
        let meta = match fs::symlink_metadata(&fs_path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::error!(path = %fs_path.display(), %err, "link_stat failed");
                self.io_error = true;
                return;
            }
        };

        if meta.is_dir() && !self.opts.recurse {
            tracing::info!(path = %fs_path.display(), "skipping directory");
            return;
        }

        self.root_dev = meta.dev();
        self.add_file(name, &meta, flags::DELETE);
        if meta.is_dir() && self.opts.recurse {
            self.walk_directory(name, flags::DELETE);
        }
    }

    fn fs_path(&self, rel: &[u8]) -> PathBuf {
        let rel = OsStr::from_bytes(rel);
        match &self.basedir {
            Some(base) => Path::new(base.as_ref()).join(rel),
            None => PathBuf::from(rel),
        }
    }

    fn walk_directory(&mut self, rel: &[u8], base_flags: u8) {
        let fs_path = self.fs_path(rel);
        let reader = match fs::read_dir(&fs_path) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::error!(path = %fs_path.display(), %err, "opendir failed");
                self.io_error = true;
                return;
            }
        };

        let mut names: Vec<_> = Vec::new();
        for item in reader {
            match item {
                Ok(item) => names.push(item.file_name()),
                Err(err) => {
                    tracing::error!(path = %fs_path.display(), %err, "readdir failed");
                    self.io_error = true;
                }
            }
        }
        names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        for name in names {
            let mut child = Vec::new();
            if rel != b"." {
                child.extend_from_slice(rel);
                child.push(b'/');
            }
            child.extend_from_slice(name.as_bytes());

            let child_path = self.fs_path(&child);
            let meta = match fs::symlink_metadata(&child_path) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::error!(path = %child_path.display(), %err, "link_stat failed");
                    self.io_error = true;
                    continue;
                }
            };

            if self.excluded(&child, meta.is_dir()) {
                continue;
            }

            self.add_file(&child, &meta, base_flags);

            if meta.is_dir() {
                if self.opts.one_file_system && meta.dev() != self.root_dev {
                    continue;
                }
                self.walk_directory(&child, base_flags);
            }
        }
    }

    fn excluded(&self, name: &[u8], is_dir: bool) -> bool {
        let text = String::from_utf8_lossy(name);
        self.opts.filters.excludes(&text, is_dir)
    }

    fn add_file(&mut self, rel: &[u8], meta: &fs::Metadata, base_flags: u8) {
        let (dirname, basename) = match rel.iter().rposition(|&b| b == b'/') {
            Some(pos) => {
                let dir_bytes = &rel[..pos];
                let dir = match &self.last_dir {
                    Some(last) if last.as_bytes() == dir_bytes => Arc::clone(last),
                    _ => {
                        let fresh: Arc<OsStr> = Arc::from(OsStr::from_bytes(dir_bytes));
                        self.last_dir = Some(Arc::clone(&fresh));
                        fresh
                    }
                };
                (
                    Some(dir),
                    OsStr::from_bytes(&rel[pos + 1..]).to_os_string(),
                )
            }
            None => (None, OsStr::from_bytes(rel).to_os_string()),
        };

        let mut entry = FileEntry {
            flags: base_flags,
            basename,
            dirname,
            basedir: self.basedir.clone(),
            modtime: meta.mtime(),
            length: meta.len(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            ..FileEntry::default()
        };

        let file_type = meta.file_type();
        if entry.is_device() {
            entry.rdev = meta.rdev() as u32;
        }
        if self.opts.preserve_hard_links && file_type.is_file() {
            entry.dev = meta.dev();
            entry.inode = meta.ino();
        }
        if self.opts.preserve_links && file_type.is_symlink() {
            match fs::read_link(self.fs_path(rel)) {
                Ok(target) => entry.link = Some(target.into_os_string()),
                Err(err) => {
                    tracing::error!(path = %self.fs_path(rel).display(), %err, "readlink failed");
                    self.io_error = true;
                    return;
                }
            }
        }
        if self.opts.always_checksum && file_type.is_file() {
            entry.sum = Some(file_checksum(
                &self.fs_path(rel),
                self.opts.checksum_seed,
            ));
        }

        self.list.entries.push(entry);
    }
}

/// Whole-file seeded digest; unreadable files digest as all zeroes, the
/// transfer will notice the mismatch later.
#[must_use]
pub fn file_checksum(path: &Path, seed: u32) -> [u8; 16] {
    let Ok(mut file) = fs::File::open(path) else {
        return [0u8; 16];
    };
    let mut digest = FileDigest::new(seed);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => digest.update(&buf[..n]),
            Err(_) => return [0u8; 16],
        }
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).expect("create");
        file.write_all(contents).expect("write");
    }

    fn names(list: &FileList) -> Vec<String> {
        list.entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.name_bytes()).into_owned())
            .collect()
    }

    #[test]
    fn trailing_slash_sends_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_file(&tmp.path().join("a.txt"), b"aaa");
        fs::create_dir(tmp.path().join("sub")).expect("mkdir");
        write_file(&tmp.path().join("sub/b.txt"), b"bbb");

        let mut arg = tmp.path().as_os_str().to_os_string();
        arg.push("/");
        let opts = BuildOptions {
            recurse: true,
            ..BuildOptions::default()
        };
        let (mut list, io_error) = build_file_list(&[PathBuf::from(arg)], &opts);
        assert!(!io_error);
        list.clean(false);

        assert_eq!(names(&list), vec![".", "a.txt", "sub", "sub/b.txt"]);
        for entry in &list.entries {
            assert_eq!(
                entry.basedir.as_deref(),
                Some(tmp.path().as_os_str()),
                "contents transfers root at the argument"
            );
        }
    }

    #[test]
    fn without_slash_the_directory_itself_is_named() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("tree");
        fs::create_dir(&root).expect("mkdir");
        write_file(&root.join("f"), b"f");

        let opts = BuildOptions {
            recurse: true,
            ..BuildOptions::default()
        };
        let (mut list, _) = build_file_list(&[root], &opts);
        list.clean(false);
        assert_eq!(names(&list), vec!["tree", "tree/f"]);
    }

    #[test]
    fn non_recursive_walk_skips_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("d");
        fs::create_dir(&dir).expect("mkdir");
        let (list, io_error) = build_file_list(&[dir], &BuildOptions::default());
        assert!(list.is_empty());
        assert!(!io_error);
    }

    #[test]
    fn missing_argument_sets_io_error() {
        let (list, io_error) =
            build_file_list(&[PathBuf::from("/does/not/exist")], &BuildOptions::default());
        assert!(list.is_empty());
        assert!(io_error);
    }

    #[test]
    fn filters_prune_the_walk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_file(&tmp.path().join("keep.c"), b"");
        write_file(&tmp.path().join("skip.o"), b"");
        fs::create_dir(tmp.path().join("cache")).expect("mkdir");
        write_file(&tmp.path().join("cache/deep.c"), b"");

        let mut filters = FilterList::new();
        filters.add("*.o");
        filters.add("cache/");
        let opts = BuildOptions {
            recurse: true,
            filters,
            ..BuildOptions::default()
        };

        let mut arg = tmp.path().as_os_str().to_os_string();
        arg.push("/");
        let (mut list, _) = build_file_list(&[PathBuf::from(arg)], &opts);
        list.clean(false);
        assert_eq!(names(&list), vec![".", "keep.c"]);
    }

    #[test]
    fn symlink_targets_are_recorded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_file(&tmp.path().join("real"), b"data");
        std::os::unix::fs::symlink("real", tmp.path().join("alias")).expect("symlink");

        let mut arg = tmp.path().as_os_str().to_os_string();
        arg.push("/");
        let opts = BuildOptions {
            recurse: true,
            preserve_links: true,
            ..BuildOptions::default()
        };
        let (list, _) = build_file_list(&[PathBuf::from(arg)], &opts);
        let alias = list
            .entries
            .iter()
            .find(|e| e.basename == "alias")
            .expect("alias entry");
        assert!(alias.is_symlink());
        assert_eq!(alias.link.as_deref(), Some(OsStr::new("real")));
    }

    #[test]
    fn always_checksum_digests_regular_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_file(&tmp.path().join("x"), b"hello");

        let mut arg = tmp.path().as_os_str().to_os_string();
        arg.push("/");
        let opts = BuildOptions {
            recurse: true,
            always_checksum: true,
            checksum_seed: 77,
            ..BuildOptions::default()
        };
        let (list, _) = build_file_list(&[PathBuf::from(arg)], &opts);
        let x = list.entries.iter().find(|e| e.basename == "x").expect("x");
        let expected = file_checksum(&tmp.path().join("x"), 77);
        assert_eq!(x.sum, Some(expected));
        assert_ne!(expected, [0u8; 16]);
    }
}
