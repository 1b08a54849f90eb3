use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use compress::CompressionLevel;
use flist::{BuildOptions, CodecOptions, FilterList};
use protocol::BLOCK_SIZE;

/// Transfer configuration the caller assembles before starting a
/// session. Argument parsing and config files live outside the core;
/// this is the already-digested form both roles consume.
#[derive(Clone, Debug)]
pub struct Options {
    /// Nominal signature block length; [`BLOCK_SIZE`] unless overridden,
    /// in which case block-size adaptation is disabled.
    pub block_size: u32,
    /// Abort when no stream progress happens for this long. The caller
    /// must also arm the timeout on the transport itself.
    pub io_timeout: Option<Duration>,
    /// Cap outbound bytes per second.
    pub bwlimit: Option<NonZeroU64>,
    /// Treat mtimes within this many seconds as equal.
    pub modify_window: i64,

    /// Preserve modification times.
    pub preserve_times: bool,
    /// Preserve permission bits.
    pub preserve_perms: bool,
    /// Preserve numeric owner (effective only when running as root).
    pub preserve_uid: bool,
    /// Preserve numeric group.
    pub preserve_gid: bool,
    /// Recreate symlinks.
    pub preserve_links: bool,
    /// Recreate device nodes (root only).
    pub preserve_devices: bool,
    /// Carry dev/inode pairs for hardlink detection.
    pub preserve_hard_links: bool,

    /// Compare files by whole-file checksum instead of size+mtime.
    pub always_checksum: bool,
    /// Skip the delta algorithm and send files whole.
    pub whole_file: bool,
    /// Never update files that already exist on the destination.
    pub ignore_existing: bool,
    /// Only update files that already exist on the destination.
    pub only_existing: bool,
    /// Skip files that are newer on the destination.
    pub update_only: bool,
    /// Consider equal-sized files up to date.
    pub size_only: bool,
    /// Transfer even when size and mtime already agree.
    pub ignore_times: bool,
    /// Recurse into directories.
    pub recurse: bool,
    /// Do not cross filesystem boundaries while walking.
    pub one_file_system: bool,
    /// Write runs of zeroes as holes.
    pub sparse_files: bool,
    /// Only list what would be transferred.
    pub list_only: bool,
    /// Harden received paths against escaping the destination.
    pub sanitize_paths: bool,

    /// Alternate tree consulted when the destination file is missing.
    pub compare_dest: Option<PathBuf>,
    /// Directory for temp files instead of the destination directory.
    pub temp_dir: Option<PathBuf>,
    /// Rename the previous destination aside instead of replacing it.
    pub backup: bool,
    /// Suffix for backups.
    pub backup_suffix: String,
    /// Keep a reconstructed file even when its digest never verified.
    pub partial: bool,
    /// Compress literal data on the wire.
    pub compress: Option<CompressionLevel>,

    /// Exclusion filters (sender side; the receiver transmits its own).
    pub filters: FilterList,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            io_timeout: None,
            bwlimit: None,
            modify_window: 0,
            preserve_times: true,
            preserve_perms: false,
            preserve_uid: false,
            preserve_gid: false,
            preserve_links: false,
            preserve_devices: false,
            preserve_hard_links: false,
            always_checksum: false,
            whole_file: false,
            ignore_existing: false,
            only_existing: false,
            update_only: false,
            size_only: false,
            ignore_times: false,
            recurse: true,
            one_file_system: false,
            sparse_files: false,
            list_only: false,
            sanitize_paths: false,
            compare_dest: None,
            temp_dir: None,
            backup: false,
            backup_suffix: "~".to_string(),
            partial: false,
            compress: None,
            filters: FilterList::new(),
        }
    }
}

impl Options {
    /// Wire-codec option subset for the negotiated protocol.
    #[must_use]
    pub fn codec_options(&self, protocol: i32) -> CodecOptions {
        let mut codec = CodecOptions::new(protocol);
        codec.preserve_uid = self.preserve_uid;
        codec.preserve_gid = self.preserve_gid;
        codec.preserve_devices = self.preserve_devices;
        codec.preserve_links = self.preserve_links;
        codec.preserve_hard_links = self.preserve_hard_links;
        codec.always_checksum = self.always_checksum;
        codec.sanitize_paths = self.sanitize_paths;
        codec
    }

    /// Walk options for building the file list on the sending side.
    #[must_use]
    pub fn build_options(&self, checksum_seed: u32) -> BuildOptions {
        BuildOptions {
            recurse: self.recurse,
            preserve_links: self.preserve_links,
            preserve_hard_links: self.preserve_hard_links,
            always_checksum: self.always_checksum,
            one_file_system: self.one_file_system,
            filters: self.filters.clone(),
            checksum_seed,
        }
    }

    /// Whether two mtimes agree under the configured window.
    #[must_use]
    pub fn same_time(&self, a: i64, b: i64) -> bool {
        (a - b).abs() <= self.modify_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let opts = Options::default();
        assert_eq!(opts.block_size, BLOCK_SIZE);
        assert!(opts.recurse);
        assert!(!opts.whole_file);
        assert!(opts.compress.is_none());
    }

    #[test]
    fn modify_window_widens_time_equality() {
        let mut opts = Options::default();
        assert!(opts.same_time(100, 100));
        assert!(!opts.same_time(100, 101));
        opts.modify_window = 2;
        assert!(opts.same_time(100, 102));
        assert!(!opts.same_time(100, 103));
    }
}
