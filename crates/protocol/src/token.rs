//! Match/literal token stream codec.
//!
//! The sender describes each file as a sequence of literal byte runs and
//! references to blocks the receiver already holds. Two wire forms
//! exist:
//!
//! - **plain**: a positive `u32` length introduces that many literal
//!   bytes; a negative value `-(index+1)` names block `index`; zero
//!   terminates the file.
//! - **deflated**: literal bytes travel through a shared raw-deflate
//!   stream framed in `DEFLATED_DATA` chunks, and match tokens are
//!   run-length coded with relative or absolute block numbers.
//!
//! In deflated form both peers must feed matched-block bytes through
//! their compression state even though those bytes never cross the wire;
//! [`TokenCodec::see_token`] performs the receiving half of that
//! contract, the sender half happens inside
//! [`TokenCodec::send_token`].
//!
//! The sender-facing call convention mirrors the matcher: each
//! `send_token` call carries the literal run preceding the token, then
//! the token itself. Token `-2` means "literal data only, no token
//! follows"; `-1` ends the file.

use std::io::{self, Read, Write};

use compress::{CompressionLevel, DeflateStream, InflateStream};

use crate::wire::{ReadWire, WriteWire};
use crate::CHUNK_SIZE;

const END_FLAG: u8 = 0;
const TOKEN_LONG: u8 = 0x20;
const TOKENRUN_LONG: u8 = 0x21;
const DEFLATED_DATA: u8 = 0x40;
const TOKEN_REL: u8 = 0x80;
const TOKENRUN_REL: u8 = 0xc0;

/// 14-bit payload cap of a `DEFLATED_DATA` frame.
const MAX_DATA_COUNT: usize = 16383;

/// One decoded item of the token stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenEvent {
    /// `len` literal bytes are available from [`TokenCodec::literal_data`].
    Literal(usize),
    /// Copy the named block from the local basis file.
    Match(i32),
    /// End of this file's token stream.
    Done,
}

/// Encoder/decoder for one side of the token stream.
///
/// A codec instance carries per-file state and is reused across files;
/// the end-of-file token resets it.
pub enum TokenCodec {
    /// Plain length-prefixed framing.
    Simple(SimpleCodec),
    /// Deflate-compressed framing.
    Deflated(Box<DeflatedCodec>),
}

impl TokenCodec {
    /// Creates a codec; `level` selects the deflated form.
    #[must_use]
    pub fn new(level: Option<CompressionLevel>) -> Self {
        match level {
            None => Self::Simple(SimpleCodec::default()),
            Some(level) => Self::Deflated(Box::new(DeflatedCodec::new(level))),
        }
    }

    /// Sends one literal run plus token; see the module docs for the
    /// call convention. `block` holds the matched block's bytes when
    /// `token >= 0` and is ignored otherwise.
    pub fn send_token<W: Write>(
        &mut self,
        f: &mut W,
        token: i32,
        data: &[u8],
        block: &[u8],
    ) -> io::Result<()> {
        match self {
            Self::Simple(codec) => codec.send(f, token, data),
            Self::Deflated(codec) => codec.send(f, token, data, block),
        }
    }

    /// Receives the next token-stream event.
    pub fn recv_token<R: Read>(&mut self, f: &mut R) -> io::Result<TokenEvent> {
        match self {
            Self::Simple(codec) => codec.recv(f),
            Self::Deflated(codec) => codec.recv(f),
        }
    }

    /// Literal bytes for the most recent [`TokenEvent::Literal`].
    #[must_use]
    pub fn literal_data(&self, len: usize) -> &[u8] {
        match self {
            Self::Simple(codec) => &codec.buf[..len],
            Self::Deflated(codec) => &codec.dbuf[..len],
        }
    }

    /// Folds a matched block's bytes into the receiving decompressor so
    /// its window stays in sync with the sender. No-op in plain mode.
    pub fn see_token(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Simple(_) => Ok(()),
            Self::Deflated(codec) => codec.rx.insert(data),
        }
    }
}

/// Plain, uncompressed token framing.
pub struct SimpleCodec {
    buf: Vec<u8>,
    residue: usize,
}

impl Default for SimpleCodec {
    fn default() -> Self {
        Self {
            buf: vec![0u8; CHUNK_SIZE],
            residue: 0,
        }
    }
}

impl SimpleCodec {
    fn send<W: Write>(&mut self, f: &mut W, token: i32, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(CHUNK_SIZE) {
            f.write_int(chunk.len() as i32)?;
            f.write_all(chunk)?;
        }
        // a -2 token means send data only and no token
        if token != -2 {
            f.write_int(-(token + 1))?;
        }
        Ok(())
    }

    fn recv<R: Read>(&mut self, f: &mut R) -> io::Result<TokenEvent> {
        if self.residue == 0 {
            let value = f.read_int()?;
            if value == 0 {
                return Ok(TokenEvent::Done);
            }
            if value < 0 {
                return Ok(TokenEvent::Match(-(value + 1)));
            }
            self.residue = value as usize;
        }
        let n = self.residue.min(CHUNK_SIZE);
        f.read_exact(&mut self.buf[..n])?;
        self.residue -= n;
        Ok(TokenEvent::Literal(n))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RecvState {
    Init,
    Idle,
    Running,
    Inflating,
    Inflated,
}

/// Deflate-compressed token framing.
pub struct DeflatedCodec {
    // sender side
    tx: DeflateStream,
    last_token: i32,
    run_start: i32,
    last_run_end: i32,
    flush_pending: bool,
    // receiver side
    rx: InflateStream,
    state: RecvState,
    rx_token: i32,
    rx_run: u32,
    saved_flag: Option<u8>,
    cbuf: Vec<u8>,
    cbuf_pos: usize,
    dbuf: Vec<u8>,
}

impl DeflatedCodec {
    fn new(level: CompressionLevel) -> Self {
        Self {
            tx: DeflateStream::new(level),
            last_token: -1,
            run_start: 0,
            last_run_end: 0,
            flush_pending: false,
            rx: InflateStream::new(),
            state: RecvState::Init,
            rx_token: 0,
            rx_run: 0,
            saved_flag: None,
            cbuf: Vec::new(),
            cbuf_pos: 0,
            dbuf: vec![0u8; CHUNK_SIZE],
        }
    }

    fn send<W: Write>(
        &mut self,
        f: &mut W,
        token: i32,
        data: &[u8],
        block: &[u8],
    ) -> io::Result<()> {
        if self.last_token == -1 {
            // start of file
            self.tx.reset();
            self.last_run_end = 0;
            self.run_start = token;
            self.flush_pending = false;
        } else if self.last_token == -2 {
            self.run_start = token;
        } else if !data.is_empty()
            || token != self.last_token + 1
            || token >= self.run_start + 65536
        {
            // output the previous run of matched tokens
            let rel = self.run_start - self.last_run_end;
            let run = self.last_token - self.run_start;
            if (0..=63).contains(&rel) {
                let flag = if run == 0 { TOKEN_REL } else { TOKENRUN_REL };
                f.write_byte(flag + rel as u8)?;
            } else {
                let flag = if run == 0 { TOKEN_LONG } else { TOKENRUN_LONG };
                f.write_byte(flag)?;
                f.write_int(self.run_start)?;
            }
            if run != 0 {
                f.write_byte(run as u8)?;
                f.write_byte((run >> 8) as u8)?;
            }
            self.last_run_end = self.last_token;
            self.run_start = token;
        }

        self.last_token = token;

        if !data.is_empty() || self.flush_pending {
            self.tx.write(data)?;
            if token != -2 {
                self.tx.sync_flush()?;
            }
            self.emit_frames(f)?;
            self.flush_pending = token == -2;
        }

        if token == -1 {
            f.write_byte(END_FLAG)?;
        } else if token != -2 {
            // keep the dictionary in step with the receiver, which will
            // inflate these block bytes locally
            self.tx.insert(block);
        }
        Ok(())
    }

    fn emit_frames<W: Write>(&mut self, f: &mut W) -> io::Result<()> {
        while !self.tx.pending().is_empty() {
            let n = self.tx.pending().len().min(MAX_DATA_COUNT);
            f.write_byte(DEFLATED_DATA + (n >> 8) as u8)?;
            f.write_byte(n as u8)?;
            f.write_all(&self.tx.pending()[..n])?;
            self.tx.consume(n);
        }
        Ok(())
    }

    fn recv<R: Read>(&mut self, f: &mut R) -> io::Result<TokenEvent> {
        loop {
            match self.state {
                RecvState::Init => {
                    self.rx.reset();
                    self.rx_token = 0;
                    self.saved_flag = None;
                    self.state = RecvState::Idle;
                }

                RecvState::Idle | RecvState::Inflated => {
                    let flag = match self.saved_flag.take() {
                        Some(flag) => flag,
                        None => f.read_byte()?,
                    };

                    if (flag & 0xc0) == DEFLATED_DATA {
                        let n = (usize::from(flag & 0x3f) << 8) + usize::from(f.read_byte()?);
                        self.cbuf = f.read_vec(n)?;
                        self.cbuf_pos = 0;
                        self.state = RecvState::Inflating;
                        continue;
                    }

                    if self.state == RecvState::Inflated {
                        // check the previous inflated run ended cleanly,
                        // draining anything the decompressor still holds
                        let (_, produced) = self.rx.run(&[], &mut self.dbuf, true)?;
                        if produced != 0 {
                            self.saved_flag = Some(flag);
                            return Ok(TokenEvent::Literal(produced));
                        }
                        self.rx.resync()?;
                        self.state = RecvState::Idle;
                    }

                    if flag == END_FLAG {
                        self.state = RecvState::Init;
                        return Ok(TokenEvent::Done);
                    }

                    let run_bit = if flag & TOKEN_REL != 0 {
                        self.rx_token += i32::from(flag & 0x3f);
                        (flag >> 6) & 1
                    } else {
                        self.rx_token = f.read_int()?;
                        flag & 1
                    };
                    if run_bit != 0 {
                        let lo = u32::from(f.read_byte()?);
                        let hi = u32::from(f.read_byte()?);
                        self.rx_run = lo + (hi << 8);
                        self.state = RecvState::Running;
                    }
                    return Ok(TokenEvent::Match(self.rx_token));
                }

                RecvState::Inflating => {
                    let input = &self.cbuf[self.cbuf_pos..];
                    let (consumed, produced) = self.rx.run(input, &mut self.dbuf, false)?;
                    if consumed == 0 && produced == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "decompressor stalled on deflated data",
                        ));
                    }
                    self.cbuf_pos += consumed;
                    if self.cbuf_pos == self.cbuf.len() {
                        self.state = RecvState::Inflated;
                    }
                    if produced != 0 {
                        return Ok(TokenEvent::Literal(produced));
                    }
                }

                RecvState::Running => {
                    self.rx_token += 1;
                    self.rx_run -= 1;
                    if self.rx_run == 0 {
                        self.state = RecvState::Idle;
                    }
                    return Ok(TokenEvent::Match(self.rx_token));
                }
            }
        }
    }
}
