use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use matching::BlockSource;
use protocol::{CHUNK_SIZE, MAX_MAP_SIZE};

/// Sliding read window over an open file.
///
/// Deliberately built on `read` into a grow-only buffer instead of
/// `mmap`: another process truncating the file mid-transfer must not be
/// able to fault us. Bytes lost to a short read are zero-filled so
/// matching stays deterministic against a file changing underneath.
pub struct MapWindow {
    file: File,
    file_size: u64,
    buf: Vec<u8>,
    win_offset: u64,
    win_len: usize,
    fd_offset: u64,
}

impl std::fmt::Debug for MapWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapWindow")
            .field("file_size", &self.file_size)
            .field("win_offset", &self.win_offset)
            .field("win_len", &self.win_len)
            .finish_non_exhaustive()
    }
}

impl MapWindow {
    /// Wraps an open file of known size.
    #[must_use]
    pub fn new(file: File, file_size: u64) -> Self {
        Self {
            file,
            file_size,
            buf: Vec::new(),
            win_offset: 0,
            win_len: 0,
            fd_offset: 0,
        }
    }

    /// Size the file had when the window was created.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns the bytes at `[offset, offset + len)`, sliding the
    /// window when the request falls outside it. Requests past end of
    /// file are clamped.
    pub fn slice(&mut self, offset: u64, len: usize) -> io::Result<&[u8]> {
        if len == 0 || offset >= self.file_size {
            return Ok(&[]);
        }
        let len = (len as u64).min(self.file_size - offset) as usize;

        // in most cases the region is already available
        if offset >= self.win_offset
            && offset + len as u64 <= self.win_offset + self.win_len as u64
        {
            let start = (offset - self.win_offset) as usize;
            return Ok(&self.buf[start..start + len]);
        }

        // pick a window starting a couple of chunks back, aligned down
        // to a chunk boundary
        let chunk = CHUNK_SIZE as u64;
        let window_start = if offset > 2 * chunk {
            (offset - 2 * chunk) & !(chunk - 1)
        } else {
            0
        };
        let mut window_size = MAX_MAP_SIZE as u64;
        if window_start + window_size > self.file_size {
            window_size = self.file_size - window_start;
        }
        if offset + len as u64 > window_start + window_size {
            window_size = offset + len as u64 - window_start;
        }
        let window_size = window_size as usize;

        if window_size > self.buf.len() {
            self.buf.resize(window_size, 0);
        }

        // reuse bytes still valid from the previous window
        let (read_start, read_offset) = if window_start >= self.win_offset
            && window_start < self.win_offset + self.win_len as u64
            && window_start + window_size as u64 >= self.win_offset + self.win_len as u64
        {
            let read_start = self.win_offset + self.win_len as u64;
            let keep = (read_start - window_start) as usize;
            self.buf.copy_within(self.win_len - keep..self.win_len, 0);
            (read_start, keep)
        } else {
            (window_start, 0)
        };
        let read_size = window_size - read_offset;

        if read_size > 0 {
            if self.fd_offset != read_start {
                self.file.seek(SeekFrom::Start(read_start))?;
                self.fd_offset = read_start;
            }
            let mut filled = 0usize;
            while filled < read_size {
                match self.file.read(&mut self.buf[read_offset + filled..read_offset + read_size]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }
            if filled < read_size {
                // the file shrank mid-transfer; zeroes keep the scan
                // deterministic
                self.buf[read_offset + filled..read_offset + read_size].fill(0);
            }
            self.fd_offset += filled as u64;
        }

        self.win_offset = window_start;
        self.win_len = window_size;

        let start = (offset - self.win_offset) as usize;
        Ok(&self.buf[start..start + len])
    }
}

impl BlockSource for MapWindow {
    fn len(&self) -> u64 {
        self.file_size
    }

    fn slice(&mut self, offset: u64, len: usize) -> io::Result<&[u8]> {
        MapWindow::slice(self, offset, len)
    }
}
