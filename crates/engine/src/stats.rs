use std::io::{self, Read, Write};

use protocol::wire::{ReadWire, WriteWire};

/// Transfer counters, exchanged at the end of the session for
/// protocol ≥ 20 so the invoking side can report totals it cannot
/// observe locally.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Bytes read from the peer stream.
    pub total_read: u64,
    /// Bytes written to the peer stream.
    pub total_written: u64,
    /// Combined size of all listed regular files.
    pub total_size: u64,
    /// Combined size of the files actually transferred.
    pub total_transferred_size: u64,
    /// Bytes that crossed the wire verbatim.
    pub literal_data: u64,
    /// Bytes reconstructed from blocks already present.
    pub matched_data: u64,
    /// Wire size of the file-list exchange.
    pub flist_size: u64,
    /// Entries in the file list.
    pub num_files: u64,
    /// Files that went through the token pipeline.
    pub num_transferred_files: u64,
}

impl Stats {
    /// Writes the server-side totals: read, written, size.
    pub fn send<W: Write>(&self, f: &mut W, protocol: i32) -> io::Result<()> {
        f.write_longint(self.total_read as i64, protocol)?;
        f.write_longint(self.total_written as i64, protocol)?;
        f.write_longint(self.total_size as i64, protocol)
    }

    /// Reads the peer's totals into this struct. The peer's write
    /// direction is our read direction, so the two byte counters swap.
    pub fn recv<R: Read>(&mut self, f: &mut R, protocol: i32) -> io::Result<()> {
        self.total_written = f.read_longint(protocol)? as u64;
        self.total_read = f.read_longint(protocol)? as u64;
        self.total_size = f.read_longint(protocol)? as u64;
        Ok(())
    }
}
