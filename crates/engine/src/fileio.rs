use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

/// Chunk size for sparse-hole scanning.
const SPARSE_WRITE_SIZE: usize = 1024;

/// Destination-file writer with optional sparse-hole support.
///
/// In sparse mode runs of zeroes become seeks instead of writes; the
/// final byte position is materialised on [`finish`](Self::finish) so
/// the file length comes out right even when the data ends in a hole.
pub struct FileWriter {
    file: File,
    sparse: bool,
    last_sparse: bool,
    last_byte: u8,
    written: u64,
}

impl FileWriter {
    /// Wraps an open, writable file.
    #[must_use]
    pub fn new(file: File, sparse: bool) -> Self {
        Self {
            file,
            sparse,
            last_sparse: false,
            last_byte: 0,
            written: 0,
        }
    }

    /// Bytes logically written so far, holes included.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Appends `buf` at the current position.
    pub fn write_block(&mut self, buf: &[u8]) -> io::Result<()> {
        self.written += buf.len() as u64;
        if !self.sparse {
            return self.file.write_all(buf);
        }
        for chunk in buf.chunks(SPARSE_WRITE_SIZE) {
            self.write_sparse(chunk)?;
        }
        Ok(())
    }

    fn write_sparse(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let leading = buf.iter().take_while(|&&b| b == 0).count();
        let trailing = buf[leading..].iter().rev().take_while(|&&b| b == 0).count();

        self.last_byte = buf[buf.len() - 1];
        if leading == buf.len() || trailing > 0 {
            self.last_sparse = true;
        }

        if leading > 0 {
            self.file.seek(SeekFrom::Current(leading as i64))?;
        }
        if leading == buf.len() {
            return Ok(());
        }

        self.file.write_all(&buf[leading..buf.len() - trailing])?;
        if trailing > 0 {
            self.file.seek(SeekFrom::Current(trailing as i64))?;
        }
        Ok(())
    }

    /// Pins the file length after a trailing hole and returns the file.
    pub fn finish(mut self) -> io::Result<File> {
        if self.last_sparse && self.written > 0 {
            self.file.seek(SeekFrom::Current(-1))?;
            self.file.write_all(&[self.last_byte])?;
        }
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn round_trip(data: &[u8], sparse: bool) -> Vec<u8> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");
        let file = File::create(&path).expect("create");
        let mut writer = FileWriter::new(file, sparse);
        for chunk in data.chunks(700) {
            writer.write_block(chunk).expect("write");
        }
        writer.finish().expect("finish");

        let mut out = Vec::new();
        File::open(&path)
            .expect("open")
            .read_to_end(&mut out)
            .expect("read");
        out
    }

    #[test]
    fn plain_mode_writes_everything() {
        let data = b"plain bytes with \0 embedded".repeat(10);
        assert_eq!(round_trip(&data, false), data);
    }

    #[test]
    fn sparse_mode_preserves_content_and_length() {
        let mut data = vec![0u8; 5000];
        data[1234] = 7;
        data[4000] = 9;
        assert_eq!(round_trip(&data, true), data);

        // all zeroes, ends in a hole
        let zeroes = vec![0u8; 3000];
        assert_eq!(round_trip(&zeroes, true), zeroes);
    }

    #[test]
    fn sparse_mode_handles_dense_data() {
        let data: Vec<u8> = (1u8..=255).cycle().take(4096).collect();
        assert_eq!(round_trip(&data, true), data);
    }
}
