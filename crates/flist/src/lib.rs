//! The file list: what a transfer is about.
//!
//! The sending side walks its source trees once, applies the exclusion
//! filters, and produces an ordered list of [`FileEntry`] values that is
//! transmitted in full before any file content. Both peers then refer
//! to files exclusively by index into this shared list, so the list is
//! immutable once exchanged; duplicate paths are suppressed by marking,
//! never by removal.
//!
//! The wire form uses aggressive field-level delta compression against
//! the previous entry (shared name prefixes, repeated modes/uids/times),
//! implemented in [`codec`].

mod builder;
mod codec;
mod entry;
mod filter;
mod list;

pub use builder::{build_file_list, file_checksum, BuildOptions};
pub use codec::{recv_file_list, send_file_list, CodecOptions, RecvState, SendState};
pub use entry::{flags, FileEntry};
pub use filter::{recv_filter_list, send_filter_list, Filter, FilterList};
pub use list::{FileList, NameTable};
