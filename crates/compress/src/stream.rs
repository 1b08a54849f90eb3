use std::io::{self, Read, Write};

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::CompressionLevel;

/// Size of the deflate history window (32 KiB, `windowBits` 15).
pub const HISTORY_LEN: usize = 32 * 1024;

fn compress_error(err: flate2::CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn decompress_error(err: flate2::DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Trailing bytes of an empty stored block emitted by a sync flush.
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Last `HISTORY_LEN` bytes of everything the stream has seen, literals
/// and matched blocks alike.
#[derive(Debug, Default)]
struct History {
    buf: Vec<u8>,
}

impl History {
    fn push(&mut self, data: &[u8]) {
        if data.len() >= HISTORY_LEN {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - HISTORY_LEN..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(HISTORY_LEN);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(data);
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Sending-side raw deflate stream.
///
/// Literal bytes go through [`write`](Self::write) and come back out of
/// [`pending`](Self::pending) as compressed data. Matched-block bytes,
/// which the receiver reconstructs locally, are folded into the
/// compressor's dictionary via [`insert`](Self::insert) so both ends keep
/// identical history. Insertion is realised as a reset plus
/// `set_dictionary` with the trailing window, which is only legal at a
/// sync point; callers must sync-flush any literal data first, which the
/// token codec already does.
pub struct DeflateStream {
    strm: Compress,
    history: History,
    dict_stale: bool,
    out: Vec<u8>,
}

impl std::fmt::Debug for DeflateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateStream")
            .field("dict_stale", &self.dict_stale)
            .field("pending", &self.out.len())
            .finish_non_exhaustive()
    }
}

impl DeflateStream {
    /// Creates a raw deflate stream at the given level.
    #[must_use]
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            strm: Compress::new(level.into(), false),
            history: History::default(),
            dict_stale: false,
            out: Vec::new(),
        }
    }

    /// Compresses `input`, appending any produced bytes to the pending
    /// output buffer.
    pub fn write(&mut self, input: &[u8]) -> io::Result<()> {
        self.refresh_dictionary()?;
        self.history.push(input);
        self.run(input, FlushCompress::None)
    }

    /// Flushes the compressor to a byte boundary and strips the empty
    /// stored block (`00 00 ff ff`) the flush appends; the receiver
    /// re-synthesises it locally.
    pub fn sync_flush(&mut self) -> io::Result<()> {
        self.refresh_dictionary()?;
        self.run(&[], FlushCompress::Sync)?;
        debug_assert!(self.out.ends_with(&SYNC_TRAILER));
        let trimmed = self.out.len().saturating_sub(SYNC_TRAILER.len());
        self.out.truncate(trimmed);
        Ok(())
    }

    /// Folds a matched block into the compressor's history without
    /// emitting any output.
    pub fn insert(&mut self, block: &[u8]) {
        self.history.push(block);
        self.dict_stale = true;
    }

    /// Compressed bytes produced so far and not yet consumed.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.out
    }

    /// Discards the first `n` pending bytes after the caller framed them.
    pub fn consume(&mut self, n: usize) {
        self.out.drain(..n);
    }

    /// Resets stream, history and pending output for the next file.
    pub fn reset(&mut self) {
        self.strm.reset();
        self.history.clear();
        self.out.clear();
        self.dict_stale = false;
    }

    fn refresh_dictionary(&mut self) -> io::Result<()> {
        if !self.dict_stale {
            return Ok(());
        }
        self.strm.reset();
        if !self.history.as_slice().is_empty() {
            self.strm
                .set_dictionary(self.history.as_slice())
                .map_err(compress_error)?;
        }
        self.dict_stale = false;
        Ok(())
    }

    fn run(&mut self, mut input: &[u8], flush: FlushCompress) -> io::Result<()> {
        loop {
            self.out.reserve(8192);
            let before_in = self.strm.total_in();
            let before_out = self.strm.total_out();
            let status = self
                .strm
                .compress_vec(input, &mut self.out, flush)
                .map_err(compress_error)?;
            let consumed = (self.strm.total_in() - before_in) as usize;
            let produced = (self.strm.total_out() - before_out) as usize;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                return Ok(());
            }
            if input.is_empty() {
                match flush {
                    FlushCompress::None => return Ok(()),
                    // a flush is complete once the compressor stops
                    // producing output
                    _ if produced == 0 => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Receiving-side raw inflate stream.
///
/// The DEFLATED_DATA payloads pass through [`run`](Self::run); matched
/// blocks the sender never transmitted are replayed into the window with
/// [`insert`](Self::insert) as synthetic stored blocks, and
/// [`resync`](Self::resync) restores the `00 00 ff ff` sync trailer the
/// sender trimmed.
pub struct InflateStream {
    strm: Decompress,
}

impl std::fmt::Debug for InflateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflateStream").finish_non_exhaustive()
    }
}

impl Default for InflateStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InflateStream {
    /// Creates a raw inflate stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strm: Decompress::new(false),
        }
    }

    /// Resets the stream for the next file.
    pub fn reset(&mut self) {
        self.strm.reset(false);
    }

    /// Runs one inflate step, returning `(consumed, produced)` byte
    /// counts. `sync` requests a flush of pending output even when no
    /// input is supplied.
    pub fn run(&mut self, input: &[u8], output: &mut [u8], sync: bool) -> io::Result<(usize, usize)> {
        let flush = if sync {
            FlushDecompress::Sync
        } else {
            FlushDecompress::None
        };
        let before_in = self.strm.total_in();
        let before_out = self.strm.total_out();
        // BufError just means no progress was made; the state machine
        // retries with more input or output space.
        match self.strm.decompress(input, output, flush) {
            Ok(_) => {}
            Err(err) => return Err(decompress_error(err)),
        }
        Ok((
            (self.strm.total_in() - before_in) as usize,
            (self.strm.total_out() - before_out) as usize,
        ))
    }

    /// Replays matched-block bytes through the decompressor so its window
    /// matches the sender's dictionary. The bytes are wrapped in fake
    /// stored-block headers and the inflated output is discarded.
    pub fn insert(&mut self, mut data: &[u8]) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while !data.is_empty() {
            let blklen = data.len().min(0xffff);
            let hdr = [
                0u8,
                (blklen & 0xff) as u8,
                (blklen >> 8) as u8,
                !((blklen & 0xff) as u8),
                !((blklen >> 8) as u8),
            ];
            self.consume_all(&hdr, &mut scratch)?;
            self.consume_all(&data[..blklen], &mut scratch)?;
            data = &data[blklen..];
        }
        Ok(())
    }

    /// Feeds the empty stored block a sender sync flush trimmed off,
    /// returning the decompressor to a clean block boundary.
    pub fn resync(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        self.consume_all(&SYNC_TRAILER, &mut scratch)
    }

    fn consume_all(&mut self, mut input: &[u8], scratch: &mut [u8]) -> io::Result<()> {
        while !input.is_empty() {
            let (consumed, produced) = self.run(input, scratch, true)?;
            if consumed == 0 && produced == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decompressor made no progress on inserted block",
                ));
            }
            input = &input[consumed..];
        }
        // drain any output still buffered for the inserted bytes
        loop {
            let (_, produced) = self.run(&[], scratch, true)?;
            if produced == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Compresses `input` into a new buffer as one raw deflate stream.
pub fn compress_to_vec(input: &[u8], level: CompressionLevel) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), level.into());
    encoder.write_all(input)?;
    encoder.finish()
}

/// Decompresses a complete raw deflate stream into a new buffer.
pub fn decompress_to_vec(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(input);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a receiver over a sender's pending output, collecting the
    /// inflated literal bytes.
    fn inflate_all(rx: &mut InflateStream, mut input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while !input.is_empty() {
            let (consumed, produced) = rx.run(input, &mut buf, false).expect("inflate");
            out.extend_from_slice(&buf[..produced]);
            input = &input[consumed..];
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        loop {
            let (_, produced) = rx.run(&[], &mut buf, true).expect("inflate flush");
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&buf[..produced]);
        }
        out
    }

    #[test]
    fn literal_round_trip() {
        let mut tx = DeflateStream::new(CompressionLevel::Default);
        let payload = b"The quick brown fox jumps over the lazy dog".repeat(8);
        tx.write(&payload).expect("compress");
        tx.sync_flush().expect("flush");

        let mut rx = InflateStream::new();
        let got = inflate_all(&mut rx, tx.pending());
        rx.resync().expect("resync");
        assert_eq!(got, payload);
    }

    #[test]
    fn pending_consume_drains_front() {
        let mut tx = DeflateStream::new(CompressionLevel::Default);
        tx.write(b"0123456789").expect("compress");
        tx.sync_flush().expect("flush");
        let total = tx.pending().len();
        assert!(total > 0);
        tx.consume(1);
        assert_eq!(tx.pending().len(), total - 1);
    }

    #[test]
    fn inserted_blocks_keep_dictionaries_in_sync() {
        // A matched block is inserted on both sides without travelling
        // the wire; the following literal compresses against it and must
        // still inflate correctly.
        let block: Vec<u8> = (0u32..2048)
            .map(|i| (i.wrapping_mul(2654435761) >> 11) as u8)
            .collect();
        let lit1 = b"first literal run".to_vec();
        // repeat the block content so the compressor back-references it
        let lit2 = block.clone();

        let mut tx = DeflateStream::new(CompressionLevel::Default);
        let mut rx = InflateStream::new();

        tx.write(&lit1).expect("compress lit1");
        tx.sync_flush().expect("flush lit1");
        let frame1 = tx.pending().to_vec();
        tx.consume(frame1.len());

        tx.insert(&block);

        tx.write(&lit2).expect("compress lit2");
        tx.sync_flush().expect("flush lit2");
        let frame2 = tx.pending().to_vec();
        tx.consume(frame2.len());

        let got1 = inflate_all(&mut rx, &frame1);
        assert_eq!(got1, lit1);
        rx.resync().expect("resync after lit1");
        rx.insert(&block).expect("insert block");

        let got2 = inflate_all(&mut rx, &frame2);
        assert_eq!(got2, lit2);
        rx.resync().expect("resync after lit2");

        // with the dictionary shared, the second frame should compress
        // far below the raw block size
        assert!(frame2.len() < lit2.len() / 4, "dictionary was not reused");
    }

    #[test]
    fn reset_clears_state_for_next_file() {
        let mut tx = DeflateStream::new(CompressionLevel::Default);
        tx.write(b"leftovers").expect("compress");
        tx.sync_flush().expect("flush");
        tx.reset();
        assert!(tx.pending().is_empty());

        tx.write(b"fresh file").expect("compress");
        tx.sync_flush().expect("flush");
        let mut rx = InflateStream::new();
        assert_eq!(inflate_all(&mut rx, tx.pending()), b"fresh file");
    }

    #[test]
    fn helper_round_trip() {
        let payload = b"one-shot helpers".repeat(11);
        let compressed = compress_to_vec(&payload, CompressionLevel::Best).expect("compress");
        let decoded = decompress_to_vec(&compressed).expect("decompress");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn history_keeps_trailing_window() {
        let mut history = History::default();
        history.push(&vec![1u8; HISTORY_LEN]);
        history.push(&[2u8, 2, 2]);
        assert_eq!(history.as_slice().len(), HISTORY_LEN);
        assert_eq!(&history.as_slice()[HISTORY_LEN - 3..], &[2, 2, 2]);

        history.push(&vec![3u8; HISTORY_LEN + 10]);
        assert_eq!(history.as_slice().len(), HISTORY_LEN);
        assert!(history.as_slice().iter().all(|&b| b == 3));
    }
}
