use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use crate::entry::FileEntry;

/// uid/gid name table carried after the entries for protocol ≥ 15.
///
/// Only the ids and names travel here; mapping them onto local accounts
/// is the caller's concern.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameTable {
    /// Distinct user ids with their sender-side names.
    pub uids: Vec<(u32, Vec<u8>)>,
    /// Distinct group ids with their sender-side names.
    pub gids: Vec<(u32, Vec<u8>)>,
}

/// Ordered sequence of file entries; the index is the transfer handle
/// all downstream messages use.
#[derive(Clone, Debug, Default)]
pub struct FileList {
    /// The entries, sorted by full path after [`FileList::clean`].
    pub entries: Vec<FileEntry>,
    /// Name table received alongside the list (empty on the sender).
    pub names: NameTable,
}

impl FileList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, suppressed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks an entry up by wire index.
    #[must_use]
    pub fn get(&self, index: i32) -> Option<&FileEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    /// Combined size of the regular files in the list.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_regular() && !e.suppressed)
            .map(|e| e.length)
            .sum()
    }

    /// Sorts by full path with unsigned byte comparison and suppresses
    /// duplicate paths, keeping the first of each run. Entries are never
    /// removed: indices are already (or about to be) shared with the
    /// peer.
    pub fn clean(&mut self, strip_root: bool) {
        self.entries.sort_by(|a, b| a.name_bytes().cmp(&b.name_bytes()));

        let mut prev: Option<Vec<u8>> = None;
        for entry in &mut self.entries {
            let name = entry.name_bytes();
            if prev.as_deref() == Some(name.as_slice()) {
                tracing::debug!(name = %String::from_utf8_lossy(&name), "removing duplicate from file list");
                entry.suppressed = true;
            } else {
                prev = Some(name);
            }
        }

        if strip_root {
            for entry in &mut self.entries {
                let Some(dir) = &entry.dirname else { continue };
                let bytes = dir.as_bytes();
                if bytes.first() == Some(&b'/') {
                    let stripped = &bytes[1..];
                    entry.dirname = if stripped.is_empty() {
                        None
                    } else {
                        Some(Arc::from(OsStr::from_bytes(stripped)))
                    };
                }
            }
        }
    }
}

/// Normalises a wire path: collapses `//`, drops `./` components and any
/// trailing slash.
#[must_use]
pub fn clean_path(name: &[u8]) -> Vec<u8> {
    let absolute = name.first() == Some(&b'/');
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in name.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            other => parts.push(other),
        }
    }

    let mut out = Vec::with_capacity(name.len());
    if absolute {
        out.push(b'/');
    }
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(part);
    }
    if out.is_empty() {
        out.push(b'.');
    }
    out
}

/// Makes a wire path safe to use under the destination root: strips any
/// leading slashes and resolves `..` components so the result can never
/// escape upward.
#[must_use]
pub fn sanitize_path(name: &[u8]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in name.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                // popping keeps interior dot-dot meaningful; underflow
                // is silently discarded
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut out = Vec::with_capacity(name.len());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(part);
    }
    if out.is_empty() {
        out.push(b'.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn entry(dir: Option<&str>, base: &str) -> FileEntry {
        FileEntry {
            basename: OsString::from(base),
            dirname: dir.map(|d| Arc::from(OsStr::new(d))),
            ..FileEntry::default()
        }
    }

    #[test]
    fn clean_sorts_by_full_path_bytes() {
        let mut list = FileList::new();
        list.entries.push(entry(Some("dir"), "bc"));
        list.entries.push(entry(None, "zzz"));
        list.entries.push(entry(Some("dir"), "a"));
        list.entries.push(entry(Some("dir"), "b"));
        list.clean(false);

        let names: Vec<Vec<u8>> = list.entries.iter().map(FileEntry::name_bytes).collect();
        assert_eq!(names, vec![b"dir/a".to_vec(), b"dir/b".to_vec(), b"dir/bc".to_vec(), b"zzz".to_vec()]);
    }

    #[test]
    fn exactly_one_of_equal_paths_survives() {
        let mut list = FileList::new();
        list.entries.push(entry(Some("d"), "same"));
        list.entries.push(entry(Some("d"), "same"));
        list.entries.push(entry(Some("d"), "same"));
        list.clean(false);

        let active = list.entries.iter().filter(|e| !e.suppressed).count();
        assert_eq!(active, 1);
        assert_eq!(list.len(), 3, "suppressed entries keep their slots");
    }

    #[test]
    fn clean_path_normalises() {
        assert_eq!(clean_path(b"a//b/./c/"), b"a/b/c");
        assert_eq!(clean_path(b"./x"), b"x");
        assert_eq!(clean_path(b"/"), b"/");
        assert_eq!(clean_path(b"."), b".");
    }

    #[test]
    fn sanitize_path_cannot_escape() {
        assert_eq!(sanitize_path(b"/etc/passwd"), b"etc/passwd");
        assert_eq!(sanitize_path(b"../../x"), b"x");
        assert_eq!(sanitize_path(b"a/../../b"), b"b");
        assert_eq!(sanitize_path(b"a/b/../c"), b"a/c");
        assert_eq!(sanitize_path(b".."), b".");
    }

    #[test]
    fn strip_root_removes_leading_slash_from_dirnames() {
        let mut list = FileList::new();
        list.entries.push(entry(Some("/top"), "f"));
        list.entries.push(entry(Some("/"), "g"));
        list.clean(true);

        // order: "/f" sorts before... after stripping we only check dirnames
        for e in &list.entries {
            if let Some(dir) = &e.dirname {
                assert_ne!(dir.as_bytes().first(), Some(&b'/'));
            }
        }
    }

    #[test]
    fn total_size_skips_suppressed_and_non_regular() {
        let mut list = FileList::new();
        let mut a = entry(None, "a");
        a.mode = 0o100644;
        a.length = 100;
        let mut b = entry(None, "a");
        b.mode = 0o100644;
        b.length = 100;
        let mut d = entry(None, "dir");
        d.mode = 0o040755;
        d.length = 4096;
        list.entries.extend([a, b, d]);
        list.clean(false);
        assert_eq!(list.total_size(), 100);
    }
}
